use actix_web::{web, HttpResponse, Responder};

use crate::state::AppState;

pub async fn handler(state: web::Data<AppState>) -> impl Responder {
    let service = state.role.service_name();
    match state.store.ping().await {
        Ok(()) => HttpResponse::Ok().json(serde_json::json!({
            "status": "ok",
            "service": service,
        })),
        Err(error) => {
            log::warn!("Health check could not reach the store: {}", error);
            HttpResponse::ServiceUnavailable().json(serde_json::json!({
                "status": "unavailable",
                "service": service,
                "error": error.to_string(),
            }))
        }
    }
}
