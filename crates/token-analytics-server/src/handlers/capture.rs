use actix_web::{web, HttpRequest, HttpResponse};
use serde::Deserialize;
use token_analytics::{resolve_user_id, IdentityHints, TokenMetrics};

use crate::error::Result;
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct IdentityQuery {
    pub user_id: Option<String>,
}

fn header(req: &HttpRequest, name: &str) -> Option<String> {
    req.headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

pub fn identity_hints(req: &HttpRequest, query: &IdentityQuery) -> IdentityHints {
    IdentityHints {
        header_user_id: header(req, "X-User-ID"),
        query_user_id: query.user_id.clone(),
        session_cookie: req.cookie("user_session").map(|c| c.value().to_string()),
        forwarded_for: header(req, "X-Forwarded-For"),
        peer_addr: req.peer_addr().map(|addr| addr.to_string()),
    }
}

/// Ingests one completed request. A record without a user id is attributed
/// through the request's identity hints.
pub async fn handler(
    req: HttpRequest,
    state: web::Data<AppState>,
    query: web::Query<IdentityQuery>,
    body: web::Bytes,
) -> Result<HttpResponse> {
    let mut record: TokenMetrics = serde_json::from_slice(&body)?;
    if record.user_id.trim().is_empty() {
        record.user_id = resolve_user_id(&identity_hints(&req, &query));
    }

    let receipt = state.capture.capture_metrics(record).await?;
    Ok(HttpResponse::Ok().json(receipt))
}
