use actix_web::{web, HttpResponse, Responder};

use crate::state::AppState;

/// Prometheus text exposition of every metric recorded in this process.
pub async fn handler(state: web::Data<AppState>) -> impl Responder {
    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(state.prometheus.render())
}
