use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use serde::Serialize;
use thiserror::Error;
use token_analytics::{CaptureError, StoreError, TimeSeriesError};

pub type Result<T, E = AppError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    TimeSeries(#[from] TimeSeriesError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Serialize)]
struct JsonError {
    message: String,
    r#type: String,
}

#[derive(Serialize)]
struct JsonErrorWrapper {
    error: JsonError,
}

impl AppError {
    fn error_type(&self) -> &'static str {
        match self.status_code() {
            StatusCode::BAD_REQUEST => "invalid_request_error",
            StatusCode::NOT_FOUND => "not_found_error",
            StatusCode::CONFLICT => "conflict_error",
            _ => "api_error",
        }
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Capture(CaptureError::InvalidRecord(_)) => StatusCode::BAD_REQUEST,
            AppError::Capture(CaptureError::SessionOwnership { .. }) => StatusCode::CONFLICT,
            AppError::Capture(CaptureError::Store { .. }) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::TimeSeries(TimeSeriesError::NotFound(_)) => StatusCode::NOT_FOUND,
            AppError::TimeSeries(TimeSeriesError::InvalidQuery(_)) => StatusCode::BAD_REQUEST,
            AppError::TimeSeries(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Serialization(_) => StatusCode::BAD_REQUEST,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let status_code = self.status_code();
        if status_code.is_server_error() {
            log::error!("Request failed: {}", self);
        }
        let error_response = JsonErrorWrapper {
            error: JsonError {
                message: self.to_string(),
                r#type: self.error_type().to_string(),
            },
        };
        HttpResponse::build(status_code).json(error_response)
    }
}
