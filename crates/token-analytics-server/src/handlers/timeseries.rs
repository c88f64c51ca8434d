use actix_web::{web, HttpResponse};
use serde::Deserialize;
use token_analytics::TimeSeriesQuery;

use crate::error::{AppError, Result};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct LatestQuery {
    pub key: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AddPointRequest {
    pub key: String,
    #[serde(default)]
    pub timestamp: i64,
    pub value: f64,
}

pub async fn query(state: web::Data<AppState>, body: web::Bytes) -> Result<HttpResponse> {
    let query: TimeSeriesQuery = serde_json::from_slice(&body)?;
    let response = state.series.query_range(&query).await?;
    Ok(HttpResponse::Ok().json(response))
}

pub async fn multi_query(state: web::Data<AppState>, body: web::Bytes) -> Result<HttpResponse> {
    let queries: Vec<TimeSeriesQuery> = serde_json::from_slice(&body)?;
    let responses = state.series.query_multi_range(&queries).await?;
    Ok(HttpResponse::Ok().json(responses))
}

pub async fn latest(
    state: web::Data<AppState>,
    query: web::Query<LatestQuery>,
) -> Result<HttpResponse> {
    let key = query
        .key
        .as_deref()
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .ok_or_else(|| AppError::BadRequest("key parameter is required".to_string()))?;

    let point = state.series.get_latest_value(key).await?;
    Ok(HttpResponse::Ok().json(point))
}

pub async fn add_point(state: web::Data<AppState>, body: web::Bytes) -> Result<HttpResponse> {
    let request: AddPointRequest = serde_json::from_slice(&body)?;
    let point = state
        .series
        .add_data_point(&request.key, request.timestamp, request.value)
        .await?;
    Ok(HttpResponse::Created().json(point))
}
