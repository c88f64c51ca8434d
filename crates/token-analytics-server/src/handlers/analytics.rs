use actix_web::{web, HttpResponse};

use crate::error::Result;
use crate::state::AppState;

pub async fn handler(state: web::Data<AppState>) -> Result<HttpResponse> {
    let snapshot = state.analytics.get_analytics().await?;
    Ok(HttpResponse::Ok().json(snapshot))
}
