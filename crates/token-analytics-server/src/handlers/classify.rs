use actix_web::{web, HttpResponse};
use serde::Deserialize;

use crate::error::{AppError, Result};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ClassifyRequest {
    pub message: String,
}

pub async fn handler(
    state: web::Data<AppState>,
    body: web::Bytes,
) -> Result<HttpResponse> {
    let request: ClassifyRequest = serde_json::from_slice(&body)?;
    if request.message.trim().is_empty() {
        return Err(AppError::BadRequest("message is required".to_string()));
    }

    let classification = state.classifier.classify(&request.message);
    log::debug!(
        "Classified message as {}",
        classification.task_type.as_str()
    );
    Ok(HttpResponse::Ok().json(classification))
}
