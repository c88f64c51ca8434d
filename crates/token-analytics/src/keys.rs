//! Persisted key layout shared by capture, analytics and the rollup.

use std::time::Duration;

use chrono::{DateTime, Utc};

pub const ACTIVE_SESSIONS: &str = "sessions:active";
pub const INPUT_TOKENS_COUNTER: &str = "tokens:input:count";
pub const OUTPUT_TOKENS_COUNTER: &str = "tokens:output:count";
pub const REQUESTS_COUNTER: &str = "requests:total:count";
pub const ERRORS_COUNTER: &str = "errors:total:count";

pub const USER_AGGREGATE_PATTERN: &str = "user:*:tokens";
pub const MODEL_AGGREGATE_PATTERN: &str = "model:*:usage";

pub const REQUEST_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);
pub const SESSION_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);
pub const HOURLY_BUCKET_TTL: Duration = Duration::from_secs(90 * 24 * 60 * 60);
pub const LATENCY_BUCKET_TTL: Duration = Duration::from_secs(60 * 60);

/// Sliding windows a user is counted as active in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActivityWindow {
    FiveMinutes,
    FifteenMinutes,
    OneHour,
    OneDay,
}

impl ActivityWindow {
    pub const ALL: [ActivityWindow; 4] = [
        Self::FiveMinutes,
        Self::FifteenMinutes,
        Self::OneHour,
        Self::OneDay,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Self::FiveMinutes => "5m",
            Self::FifteenMinutes => "15m",
            Self::OneHour => "1h",
            Self::OneDay => "24h",
        }
    }

    pub fn duration(self) -> Duration {
        match self {
            Self::FiveMinutes => Duration::from_secs(5 * 60),
            Self::FifteenMinutes => Duration::from_secs(15 * 60),
            Self::OneHour => Duration::from_secs(60 * 60),
            Self::OneDay => Duration::from_secs(24 * 60 * 60),
        }
    }

    pub fn key(self) -> String {
        format!("users:active:{}", self.label())
    }
}

pub fn request(request_id: &str) -> String {
    format!("request:{}:tokens", request_id)
}

pub fn session(session_id: &str) -> String {
    format!("session:{}:tokens", session_id)
}

pub fn user(user_id: &str) -> String {
    format!("user:{}:tokens", user_id)
}

/// Secondary index from a user to the session currently bound to them.
pub fn user_session_index(user_id: &str) -> String {
    format!("user:{}:session", user_id)
}

pub fn user_hourly(user_id: &str, at: DateTime<Utc>) -> String {
    format!("user:{}:tokens:hourly:{}", user_id, at.format("%Y-%m-%d-%H"))
}

pub fn model(model: &str) -> String {
    format!("model:{}:usage", model)
}

pub fn error_counter(kind: &str) -> String {
    format!("errors:{}:count", kind)
}

pub fn latency_bucket(at: DateTime<Utc>) -> String {
    format!("latency:response_ms:{}", at.format("%Y-%m-%d-%H-%M"))
}

/// Extracts the id from `user:<id>:tokens`.
pub fn user_id_from_key(key: &str) -> Option<&str> {
    key.strip_prefix("user:")?.strip_suffix(":tokens")
}

/// Extracts the model name from `model:<name>:usage`.
pub fn model_from_key(key: &str) -> Option<&str> {
    key.strip_prefix("model:")?.strip_suffix(":usage")
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;

    #[test]
    fn hourly_and_latency_keys_use_utc_buckets() {
        let at = Utc
            .with_ymd_and_hms(2026, 2, 10, 7, 42, 5)
            .single()
            .expect("valid datetime");
        assert_eq!(user_hourly("u1", at), "user:u1:tokens:hourly:2026-02-10-07");
        assert_eq!(latency_bucket(at), "latency:response_ms:2026-02-10-07-42");
    }

    #[test]
    fn ids_round_trip_through_aggregate_keys() {
        assert_eq!(user_id_from_key(&user("user_10.0.0.1")), Some("user_10.0.0.1"));
        assert_eq!(model_from_key(&model("llama3:8b")), Some("llama3:8b"));
        assert_eq!(user_id_from_key("user:u1:session"), None);
    }

    #[test]
    fn window_keys_match_their_labels() {
        let keys: Vec<String> = ActivityWindow::ALL.iter().map(|w| w.key()).collect();
        assert_eq!(
            keys,
            vec![
                "users:active:5m",
                "users:active:15m",
                "users:active:1h",
                "users:active:24h"
            ]
        );
        assert_eq!(ActivityWindow::OneHour.duration().as_secs(), 3600);
    }
}
