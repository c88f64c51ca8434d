use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One completed model call as reported by the chat front end.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TokenMetrics {
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub user_id: String,
    pub model_used: String,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub response_time_ms: f64,
    #[serde(default)]
    pub first_token_latency_ms: f64,
    #[serde(default)]
    pub prompt_length: u64,
    #[serde(default)]
    pub response_length: u64,
    #[serde(default = "default_status")]
    pub status: String,
}

fn default_status() -> String {
    RequestStatus::Success.as_str().to_string()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Success,
    Error,
    Timeout,
    RateLimit,
}

impl RequestStatus {
    pub const ERROR_KINDS: [RequestStatus; 3] = [Self::Timeout, Self::Error, Self::RateLimit];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::Timeout => "timeout",
            Self::RateLimit => "rate_limit",
        }
    }

    pub fn from_db(value: &str) -> Option<Self> {
        match value {
            "success" | "ok" => Some(Self::Success),
            "error" => Some(Self::Error),
            "timeout" => Some(Self::Timeout),
            "rate_limit" => Some(Self::RateLimit),
            _ => None,
        }
    }
}

/// What a successful capture resolved to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CaptureReceipt {
    pub request_id: String,
    pub session_id: String,
    pub user_id: String,
    pub new_session: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionAggregate {
    pub session_id: String,
    pub user_id: String,
    pub model_used: String,
    pub status: String,
    pub start_time: Option<DateTime<Utc>>,
    pub last_activity: Option<DateTime<Utc>>,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub request_count: u64,
    pub avg_response_time: f64,
}

impl SessionAggregate {
    pub fn from_fields(session_id: &str, fields: &HashMap<String, String>) -> Self {
        let request_count = parse_u64(fields, "request_count");
        Self {
            session_id: session_id.to_string(),
            user_id: text(fields, "user_id"),
            model_used: text(fields, "model_used"),
            status: text(fields, "status"),
            start_time: parse_time(fields, "start_time"),
            last_activity: parse_time(fields, "last_activity"),
            total_input_tokens: parse_u64(fields, "total_input_tokens"),
            total_output_tokens: parse_u64(fields, "total_output_tokens"),
            request_count,
            avg_response_time: stored_or(fields, "avg_response_time", || {
                ratio(parse_f64(fields, "total_response_time_ms"), request_count)
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserStats {
    pub user_id: String,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_requests: u64,
    pub total_sessions: u64,
    pub avg_tokens_per_request: f64,
    pub first_seen: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
}

impl UserStats {
    pub fn from_fields(user_id: &str, fields: &HashMap<String, String>) -> Self {
        let total_input_tokens = parse_u64(fields, "total_input_tokens");
        let total_output_tokens = parse_u64(fields, "total_output_tokens");
        let total_requests = parse_u64(fields, "total_requests");
        Self {
            user_id: user_id.to_string(),
            total_input_tokens,
            total_output_tokens,
            total_requests,
            total_sessions: parse_u64(fields, "total_sessions"),
            avg_tokens_per_request: stored_or(fields, "avg_tokens_per_request", || {
                ratio(
                    total_input_tokens as f64 + total_output_tokens as f64,
                    total_requests,
                )
            }),
            first_seen: parse_time(fields, "first_seen"),
            last_seen: parse_time(fields, "last_seen"),
        }
    }

    pub fn total_tokens(&self) -> u64 {
        self.total_input_tokens + self.total_output_tokens
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelStats {
    pub total_requests: u64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub avg_response_time: f64,
    pub avg_tokens_per_second: f64,
    pub last_used: Option<DateTime<Utc>>,
}

impl ModelStats {
    pub fn from_fields(fields: &HashMap<String, String>) -> Self {
        let total_requests = parse_u64(fields, "total_requests");
        let total_output_tokens = parse_u64(fields, "total_output_tokens");
        let total_response_time_ms = parse_f64(fields, "total_response_time_ms");
        let avg_tokens_per_second = if total_response_time_ms > 0.0 {
            total_output_tokens as f64 / (total_response_time_ms / 1000.0)
        } else {
            0.0
        };

        Self {
            total_requests,
            total_input_tokens: parse_u64(fields, "total_input_tokens"),
            total_output_tokens,
            avg_response_time: stored_or(fields, "avg_response_time", || {
                ratio(total_response_time_ms, total_requests)
            }),
            avg_tokens_per_second,
            last_used: parse_time(fields, "last_used"),
        }
    }
}

/// Composite snapshot served by `GET /analytics`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalyticsSnapshot {
    pub active_users_5m: u64,
    pub active_users_1h: u64,
    pub active_sessions: u64,
    pub token_rates: BTreeMap<String, f64>,
    pub top_users: Vec<UserStats>,
    pub model_usage: BTreeMap<String, ModelStats>,
    pub response_time_p95: f64,
    pub response_time_p99: f64,
    pub error_rate: f64,
    pub timestamp: i64,
}

/// Values published by one refresh cycle.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GaugeSnapshot {
    pub active_users: BTreeMap<String, u64>,
    pub active_sessions: u64,
    pub model_usage: BTreeMap<String, ModelStats>,
    pub error_counts: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct DataPoint {
    pub timestamp: i64,
    pub value: f64,
}

fn text(fields: &HashMap<String, String>, name: &str) -> String {
    fields.get(name).cloned().unwrap_or_default()
}

fn parse_u64(fields: &HashMap<String, String>, name: &str) -> u64 {
    fields
        .get(name)
        .and_then(|value| value.parse::<i64>().ok())
        .map(|value| value.max(0) as u64)
        .unwrap_or(0)
}

fn parse_f64(fields: &HashMap<String, String>, name: &str) -> f64 {
    fields
        .get(name)
        .and_then(|value| value.parse::<f64>().ok())
        .unwrap_or(0.0)
}

/// Persisted mean when present, otherwise recomputed from the counters.
fn stored_or(fields: &HashMap<String, String>, name: &str, derive: impl FnOnce() -> f64) -> f64 {
    fields
        .get(name)
        .and_then(|value| value.parse::<f64>().ok())
        .unwrap_or_else(derive)
}

fn parse_time(fields: &HashMap<String, String>, name: &str) -> Option<DateTime<Utc>> {
    fields
        .get(name)
        .and_then(|value| DateTime::parse_from_rfc3339(value).ok())
        .map(|value| value.with_timezone(&Utc))
}

fn ratio(total: f64, count: u64) -> f64 {
    if count == 0 {
        0.0
    } else {
        total / count as f64
    }
}
