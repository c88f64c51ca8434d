//! Per-request ingestion.
//!
//! A capture resolves the caller's session and then fans the record out to
//! every aggregate in a single atomic batch: request, session, user, hourly
//! bucket, model, activity windows, global counters and the latency bucket.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Timelike, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::config::AnalyticsConfig;
use crate::keys::{self, ActivityWindow};
use crate::store::{KvStore, StoreCommand, StoreError};
use crate::types::{CaptureReceipt, RequestStatus, TokenMetrics};

const ANONYMOUS_USER: &str = "user_anonymous";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureStage {
    ResolveSession,
    Persist,
}

impl CaptureStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ResolveSession => "resolve_session",
            Self::Persist => "persist",
        }
    }
}

impl fmt::Display for CaptureStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("invalid record: {0}")]
    InvalidRecord(String),

    #[error("session {session_id} belongs to another user")]
    SessionOwnership { session_id: String },

    #[error("capture failed at {stage}: {source}")]
    Store {
        stage: CaptureStage,
        #[source]
        source: StoreError,
    },
}

impl CaptureError {
    fn at(stage: CaptureStage) -> impl FnOnce(StoreError) -> Self {
        move |source| Self::Store { stage, source }
    }
}

/// Where a caller's identity may come from, in priority order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentityHints {
    pub header_user_id: Option<String>,
    pub query_user_id: Option<String>,
    pub session_cookie: Option<String>,
    pub forwarded_for: Option<String>,
    pub peer_addr: Option<String>,
}

/// Picks the first non-empty explicit identity, otherwise derives a pseudo id
/// from the client address.
pub fn resolve_user_id(hints: &IdentityHints) -> String {
    let explicit = [
        hints.header_user_id.as_deref(),
        hints.query_user_id.as_deref(),
        hints.session_cookie.as_deref(),
    ];
    if let Some(user_id) = explicit
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|value| !value.is_empty())
    {
        return user_id.to_string();
    }

    let address = hints
        .forwarded_for
        .as_deref()
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .or_else(|| {
            hints
                .peer_addr
                .as_deref()
                .map(str::trim)
                .filter(|value| !value.is_empty())
        });

    match address {
        Some(address) => format!("user_{}", address.replace(':', "_")),
        None => ANONYMOUS_USER.to_string(),
    }
}

pub fn generate_request_id() -> String {
    format!("req_{}", hex::encode(rand::random::<[u8; 8]>()))
}

pub fn generate_session_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("sess_{}", &id[..8])
}

struct ResolvedSession {
    session_id: String,
    created: bool,
    explicit: bool,
}

pub struct CaptureService {
    store: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    config: AnalyticsConfig,
}

impl CaptureService {
    pub fn new(store: Arc<dyn KvStore>, config: AnalyticsConfig) -> Self {
        Self::with_clock(store, Arc::new(SystemClock), config)
    }

    pub fn with_clock(
        store: Arc<dyn KvStore>,
        clock: Arc<dyn Clock>,
        config: AnalyticsConfig,
    ) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    pub async fn capture_metrics(
        &self,
        mut record: TokenMetrics,
    ) -> Result<CaptureReceipt, CaptureError> {
        validate(&mut record)?;
        let now = self.clock.now();

        let request_id = record
            .request_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(generate_request_id);

        let session = self.resolve_session(&record).await?;
        let commands = self.build_batch(&record, &request_id, &session, now);

        if let Err(error) = self.store.exec_atomic(commands).await {
            self.release_new_session(&record.user_id, &session).await;
            return Err(CaptureError::Store {
                stage: CaptureStage::Persist,
                source: error,
            });
        }

        log::debug!(
            "Captured {} for user {} in session {} ({} in / {} out)",
            request_id,
            record.user_id,
            session.session_id,
            record.input_tokens,
            record.output_tokens
        );

        Ok(CaptureReceipt {
            request_id,
            session_id: session.session_id,
            user_id: record.user_id,
            new_session: session.created,
        })
    }

    async fn resolve_session(&self, record: &TokenMetrics) -> Result<ResolvedSession, CaptureError> {
        if let Some(session_id) = record
            .session_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
        {
            let owner = self
                .store
                .hget(&keys::session(session_id), "user_id")
                .await
                .map_err(CaptureError::at(CaptureStage::ResolveSession))?;

            return match owner {
                Some(owner) if owner != record.user_id => Err(CaptureError::SessionOwnership {
                    session_id: session_id.to_string(),
                }),
                owner => Ok(ResolvedSession {
                    session_id: session_id.to_string(),
                    created: owner.is_none(),
                    explicit: true,
                }),
            };
        }

        let claim = self
            .store
            .claim_session(
                &keys::user_session_index(&record.user_id),
                &generate_session_id(),
                self.config.session_idle,
            )
            .await
            .map_err(CaptureError::at(CaptureStage::ResolveSession))?;

        if claim.created {
            log::info!(
                "Started session {} for user {}",
                claim.session_id,
                record.user_id
            );
        }

        Ok(ResolvedSession {
            session_id: claim.session_id,
            created: claim.created,
            explicit: false,
        })
    }

    /// Drops a binding this capture installed so the next capture starts
    /// the session afresh.
    async fn release_new_session(&self, user_id: &str, session: &ResolvedSession) {
        if !session.created || session.explicit {
            return;
        }
        let index_key = keys::user_session_index(user_id);
        if let Err(error) = self
            .store
            .release_session(&index_key, &session.session_id)
            .await
        {
            log::warn!(
                "Failed to release session {} for user {}: {}",
                session.session_id,
                user_id,
                error
            );
        }
    }

    fn build_batch(
        &self,
        record: &TokenMetrics,
        request_id: &str,
        session: &ResolvedSession,
        now: DateTime<Utc>,
    ) -> Vec<StoreCommand> {
        let timestamp = now.to_rfc3339();
        let user_id = record.user_id.as_str();
        let session_id = session.session_id.as_str();
        let input = record.input_tokens as i64;
        let output = record.output_tokens as i64;

        let mut batch = Batch::default();

        let request_key = keys::request(request_id);
        batch.hset(
            &request_key,
            [
                ("session_id", session_id.to_string()),
                ("user_id", user_id.to_string()),
                ("timestamp", timestamp.clone()),
                ("input_tokens", record.input_tokens.to_string()),
                ("output_tokens", record.output_tokens.to_string()),
                ("response_time_ms", record.response_time_ms.to_string()),
                (
                    "first_token_latency_ms",
                    record.first_token_latency_ms.to_string(),
                ),
                ("model_used", record.model_used.clone()),
                ("prompt_length", record.prompt_length.to_string()),
                ("response_length", record.response_length.to_string()),
                ("status", record.status.clone()),
            ],
        );
        batch.expire(&request_key, keys::REQUEST_TTL);

        let session_key = keys::session(session_id);
        batch.hsetnx(&session_key, "user_id", user_id);
        batch.hsetnx(&session_key, "start_time", &timestamp);
        batch.hsetnx(&session_key, "model_used", &record.model_used);
        batch.hincr(&session_key, "total_input_tokens", input);
        batch.hincr(&session_key, "total_output_tokens", output);
        batch.hincr(&session_key, "request_count", 1);
        batch.hincr_float(&session_key, "total_response_time_ms", record.response_time_ms);
        batch.mean(
            &session_key,
            "avg_response_time",
            &["total_response_time_ms"],
            "request_count",
        );
        batch.hset(
            &session_key,
            [
                ("last_activity", timestamp.clone()),
                ("status", "active".to_string()),
            ],
        );
        batch.expire(&session_key, keys::SESSION_TTL);
        if session.explicit {
            batch.push(StoreCommand::SetWithTtl {
                key: keys::user_session_index(user_id),
                value: session_id.to_string(),
                ttl: self.config.session_idle,
            });
        }

        let user_key = keys::user(user_id);
        batch.hsetnx(&user_key, "first_seen", &timestamp);
        batch.hincr(&user_key, "total_input_tokens", input);
        batch.hincr(&user_key, "total_output_tokens", output);
        batch.hincr(&user_key, "total_requests", 1);
        if session.created {
            batch.hincr(&user_key, "total_sessions", 1);
        }
        batch.mean(
            &user_key,
            "avg_tokens_per_request",
            &["total_input_tokens", "total_output_tokens"],
            "total_requests",
        );
        batch.hset(&user_key, [("last_seen", timestamp.clone())]);

        let hourly_key = keys::user_hourly(user_id, now);
        batch.push(StoreCommand::ZAdd {
            key: hourly_key.clone(),
            member: format!("{}:input:{}:output:{}", request_id, input, output),
            score: f64::from(now.minute()),
        });
        batch.expire(&hourly_key, keys::HOURLY_BUCKET_TTL);

        let model_key = keys::model(&record.model_used);
        batch.hincr(&model_key, "total_requests", 1);
        batch.hincr(&model_key, "total_input_tokens", input);
        batch.hincr(&model_key, "total_output_tokens", output);
        batch.hincr_float(&model_key, "total_response_time_ms", record.response_time_ms);
        batch.mean(
            &model_key,
            "avg_response_time",
            &["total_response_time_ms"],
            "total_requests",
        );
        batch.hset(&model_key, [("last_used", timestamp)]);

        batch.push(StoreCommand::SAdd {
            key: keys::ACTIVE_SESSIONS.to_string(),
            member: session_id.to_string(),
        });
        for window in ActivityWindow::ALL {
            let key = window.key();
            batch.push(StoreCommand::SAdd {
                key: key.clone(),
                member: user_id.to_string(),
            });
            batch.expire(&key, window.duration());
        }

        batch.incr(keys::INPUT_TOKENS_COUNTER, input);
        batch.incr(keys::OUTPUT_TOKENS_COUNTER, output);
        batch.incr(keys::REQUESTS_COUNTER, 1);
        let outcome = error_kind(&record.status);
        if outcome != RequestStatus::Success {
            batch.incr(keys::ERRORS_COUNTER, 1);
            batch.incr(&keys::error_counter(outcome.as_str()), 1);
        }

        let latency_key = keys::latency_bucket(now);
        batch.push(StoreCommand::ZAdd {
            key: latency_key.clone(),
            member: request_id.to_string(),
            score: record.response_time_ms,
        });
        batch.expire(&latency_key, keys::LATENCY_BUCKET_TTL);

        batch.commands
    }
}

/// Statuses outside the known set are counted as generic errors.
fn error_kind(status: &str) -> RequestStatus {
    RequestStatus::from_db(status).unwrap_or(RequestStatus::Error)
}

fn validate(record: &mut TokenMetrics) -> Result<(), CaptureError> {
    record.user_id = record.user_id.trim().to_string();
    record.model_used = record.model_used.trim().to_string();
    record.status = record.status.trim().to_string();

    if record.user_id.is_empty() {
        return Err(CaptureError::InvalidRecord("user_id is required".to_string()));
    }
    if record.model_used.is_empty() {
        return Err(CaptureError::InvalidRecord(
            "model_used is required".to_string(),
        ));
    }
    for (name, value) in [
        ("response_time_ms", record.response_time_ms),
        ("first_token_latency_ms", record.first_token_latency_ms),
    ] {
        if !value.is_finite() || value < 0.0 {
            return Err(CaptureError::InvalidRecord(format!(
                "{} must be a non-negative number",
                name
            )));
        }
    }
    for (name, value) in [
        ("input_tokens", record.input_tokens),
        ("output_tokens", record.output_tokens),
    ] {
        if value > i64::MAX as u64 {
            return Err(CaptureError::InvalidRecord(format!("{} is out of range", name)));
        }
    }
    if record.status.is_empty() {
        record.status = RequestStatus::Success.as_str().to_string();
    }
    Ok(())
}

#[derive(Default)]
struct Batch {
    commands: Vec<StoreCommand>,
}

impl Batch {
    fn push(&mut self, command: StoreCommand) {
        self.commands.push(command);
    }

    fn hset<const N: usize>(&mut self, key: &str, fields: [(&str, String); N]) {
        self.push(StoreCommand::HSet {
            key: key.to_string(),
            fields: fields
                .into_iter()
                .map(|(field, value)| (field.to_string(), value))
                .collect(),
        });
    }

    fn hsetnx(&mut self, key: &str, field: &str, value: &str) {
        self.push(StoreCommand::HSetNx {
            key: key.to_string(),
            field: field.to_string(),
            value: value.to_string(),
        });
    }

    fn hincr(&mut self, key: &str, field: &str, delta: i64) {
        self.push(StoreCommand::HIncrBy {
            key: key.to_string(),
            field: field.to_string(),
            delta,
        });
    }

    fn hincr_float(&mut self, key: &str, field: &str, delta: f64) {
        self.push(StoreCommand::HIncrByFloat {
            key: key.to_string(),
            field: field.to_string(),
            delta,
        });
    }

    fn mean(&mut self, key: &str, field: &str, sum_fields: &[&str], count_field: &str) {
        self.push(StoreCommand::HSetMean {
            key: key.to_string(),
            field: field.to_string(),
            sum_fields: sum_fields.iter().map(|name| name.to_string()).collect(),
            count_field: count_field.to_string(),
        });
    }

    fn incr(&mut self, key: &str, delta: i64) {
        self.push(StoreCommand::IncrBy {
            key: key.to_string(),
            delta,
        });
    }

    fn expire(&mut self, key: &str, ttl: std::time::Duration) {
        self.push(StoreCommand::Expire {
            key: key.to_string(),
            ttl,
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{Duration, TimeZone, Utc};

    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use crate::types::UserStats;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 10, 10, 15, 0)
            .single()
            .expect("valid datetime")
    }

    fn service() -> (CaptureService, Arc<MemoryStore>, ManualClock) {
        let clock = ManualClock::new(start());
        let store = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
        let service = CaptureService::with_clock(
            store.clone(),
            Arc::new(clock.clone()),
            AnalyticsConfig::default(),
        );
        (service, store, clock)
    }

    fn record(user_id: &str, input: u64, output: u64) -> TokenMetrics {
        TokenMetrics {
            user_id: user_id.to_string(),
            model_used: "llama3:8b".to_string(),
            input_tokens: input,
            output_tokens: output,
            response_time_ms: 120.0,
            first_token_latency_ms: 40.0,
            status: "success".to_string(),
            ..TokenMetrics::default()
        }
    }

    #[tokio::test]
    async fn sequential_captures_sum_into_user_aggregate() {
        let (service, store, clock) = service();

        let mut sessions = Vec::new();
        for input in [10, 20, 30] {
            let receipt = service
                .capture_metrics(record("u1", input, 5))
                .await
                .expect("capture");
            sessions.push(receipt.session_id);
            clock.advance(Duration::minutes(1));
        }

        let fields = store.hgetall(&keys::user("u1")).await.expect("user hash");
        assert_eq!(
            fields.get("avg_tokens_per_request").map(String::as_str),
            Some("25")
        );
        let stats = UserStats::from_fields("u1", &fields);
        assert_eq!(stats.total_input_tokens, 60);
        assert_eq!(stats.total_output_tokens, 15);
        assert_eq!(stats.total_requests, 3);
        assert_eq!(stats.total_sessions, 1);
        assert_eq!(stats.avg_tokens_per_request, 25.0);

        sessions.dedup();
        assert_eq!(sessions.len(), 1);
        for key in [keys::session(&sessions[0]), keys::model("llama3:8b")] {
            assert_eq!(
                store.hget(&key, "avg_response_time").await.expect("hget"),
                Some("120".to_string())
            );
        }
        assert_eq!(
            store.get(keys::INPUT_TOKENS_COUNTER).await.expect("counter"),
            Some("60".to_string())
        );
    }

    #[tokio::test]
    async fn idle_gap_longer_than_window_starts_a_new_session() {
        let (service, store, clock) = service();

        let first = service
            .capture_metrics(record("u1", 10, 5))
            .await
            .expect("first capture");
        clock.advance(Duration::minutes(29));
        let second = service
            .capture_metrics(record("u1", 10, 5))
            .await
            .expect("second capture");
        clock.advance(Duration::minutes(31));
        let third = service
            .capture_metrics(record("u1", 10, 5))
            .await
            .expect("third capture");

        assert!(first.new_session);
        assert_eq!(second.session_id, first.session_id);
        assert!(!second.new_session);
        assert_ne!(third.session_id, first.session_id);
        assert!(third.new_session);

        assert_eq!(
            store
                .hget(&keys::user("u1"), "total_sessions")
                .await
                .expect("hget"),
            Some("2".to_string())
        );
        assert_eq!(store.scard(keys::ACTIVE_SESSIONS).await.expect("scard"), 2);
    }

    #[tokio::test]
    async fn concurrent_captures_for_one_user_lose_no_updates() {
        let (service, store, _clock) = service();
        let service = Arc::new(service);

        let handles: Vec<_> = (0..50)
            .map(|_| {
                let service = service.clone();
                tokio::spawn(async move { service.capture_metrics(record("u1", 2, 1)).await })
            })
            .collect();

        let mut session_ids = Vec::new();
        for handle in handles {
            let receipt = handle.await.expect("join").expect("capture");
            session_ids.push(receipt.session_id);
        }
        session_ids.sort();
        session_ids.dedup();

        let stats = UserStats::from_fields(
            "u1",
            &store.hgetall(&keys::user("u1")).await.expect("user hash"),
        );
        assert_eq!(stats.total_requests, 50);
        assert_eq!(stats.total_input_tokens, 100);
        assert_eq!(stats.total_sessions, 1);
        assert_eq!(session_ids.len(), 1);
        assert_eq!(
            store
                .hget(&keys::session(&session_ids[0]), "request_count")
                .await
                .expect("hget"),
            Some("50".to_string())
        );
    }

    #[tokio::test]
    async fn failed_requests_bump_error_counters() {
        let (service, store, _clock) = service();

        let mut timeout = record("u1", 10, 0);
        timeout.status = "timeout".to_string();
        service.capture_metrics(timeout).await.expect("capture");
        service
            .capture_metrics(record("u1", 10, 5))
            .await
            .expect("capture");

        assert_eq!(
            store.get(&keys::error_counter("timeout")).await.expect("get"),
            Some("1".to_string())
        );
        assert_eq!(
            store.get(keys::ERRORS_COUNTER).await.expect("get"),
            Some("1".to_string())
        );
        assert_eq!(
            store.get(keys::REQUESTS_COUNTER).await.expect("get"),
            Some("2".to_string())
        );
    }

    #[tokio::test]
    async fn unknown_statuses_count_as_generic_errors() {
        let (service, store, _clock) = service();

        for status in ["total", "weird:*"] {
            let mut odd = record("u1", 10, 0);
            odd.status = status.to_string();
            service.capture_metrics(odd).await.expect("capture");
        }

        assert_eq!(
            store.get(keys::ERRORS_COUNTER).await.expect("get"),
            Some("2".to_string())
        );
        assert_eq!(
            store.get(&keys::error_counter("error")).await.expect("get"),
            Some("2".to_string())
        );
        assert!(store
            .scan_keys("errors:weird*")
            .await
            .expect("scan")
            .is_empty());
        assert_eq!(
            store
                .get(keys::REQUESTS_COUNTER)
                .await
                .expect("get"),
            Some("2".to_string())
        );
    }

    #[tokio::test]
    async fn overflowing_counter_fails_at_persist_without_partial_writes() {
        let (service, store, _clock) = service();

        service
            .capture_metrics(record("u1", i64::MAX as u64, 0))
            .await
            .expect("first capture");
        let result = service.capture_metrics(record("u2", 5, 0)).await;

        assert!(matches!(
            result,
            Err(CaptureError::Store {
                stage: CaptureStage::Persist,
                source: StoreError::Overflow(_),
            })
        ));
        assert_eq!(
            store.get(keys::INPUT_TOKENS_COUNTER).await.expect("get"),
            Some(i64::MAX.to_string())
        );
        assert!(store
            .hgetall(&keys::user("u2"))
            .await
            .expect("user hash")
            .is_empty());
        assert_eq!(
            store
                .get(&keys::user_session_index("u2"))
                .await
                .expect("index"),
            None
        );
    }

    #[tokio::test]
    async fn failed_persist_releases_a_newly_claimed_session() {
        let (service, store, _clock) = service();
        store
            .exec_atomic(vec![StoreCommand::SAdd {
                key: keys::model("bad"),
                member: "not-a-hash".to_string(),
            }])
            .await
            .expect("seed");

        let mut broken = record("u1", 10, 5);
        broken.model_used = "bad".to_string();
        let result = service.capture_metrics(broken).await;
        assert!(matches!(
            result,
            Err(CaptureError::Store {
                stage: CaptureStage::Persist,
                ..
            })
        ));
        assert_eq!(
            store
                .get(&keys::user_session_index("u1"))
                .await
                .expect("index"),
            None
        );

        let receipt = service
            .capture_metrics(record("u1", 10, 5))
            .await
            .expect("capture");
        assert!(receipt.new_session);
        assert_eq!(
            store
                .hget(&keys::user("u1"), "total_sessions")
                .await
                .expect("hget"),
            Some("1".to_string())
        );
    }

    #[tokio::test]
    async fn captured_keys_expire_on_their_own_schedules() {
        let (service, store, clock) = service();

        let mut tagged = record("u1", 12, 34);
        tagged.request_id = Some("req_ttl".to_string());
        let receipt = service.capture_metrics(tagged).await.expect("capture");

        let request_key = keys::request("req_ttl");
        let session_key = keys::session(&receipt.session_id);
        let hourly_key = keys::user_hourly("u1", start());
        let present = |fields: &std::collections::HashMap<String, String>| !fields.is_empty();

        clock.advance(Duration::days(7) - Duration::seconds(1));
        assert!(present(&store.hgetall(&request_key).await.expect("request")));
        clock.advance(Duration::seconds(1));
        assert!(!present(&store.hgetall(&request_key).await.expect("request")));
        assert!(present(&store.hgetall(&session_key).await.expect("session")));

        clock.advance(Duration::days(23));
        assert!(!present(&store.hgetall(&session_key).await.expect("session")));
        assert!(!store
            .zrange_with_scores(&hourly_key)
            .await
            .expect("hourly")
            .is_empty());

        clock.advance(Duration::days(60));
        assert!(store
            .zrange_with_scores(&hourly_key)
            .await
            .expect("hourly")
            .is_empty());
        assert!(present(&store.hgetall(&keys::user("u1")).await.expect("user")));
    }

    #[tokio::test]
    async fn explicit_session_owned_by_another_user_is_rejected() {
        let (service, store, _clock) = service();

        let mut owned = record("u1", 10, 5);
        owned.session_id = Some("sess_shared".to_string());
        let receipt = service.capture_metrics(owned).await.expect("capture");
        assert!(receipt.new_session);

        let mut intruder = record("u2", 10, 5);
        intruder.session_id = Some("sess_shared".to_string());
        let result = service.capture_metrics(intruder).await;

        assert!(matches!(
            result,
            Err(CaptureError::SessionOwnership { session_id }) if session_id == "sess_shared"
        ));
        assert!(store
            .hgetall(&keys::user("u2"))
            .await
            .expect("user hash")
            .is_empty());
        assert_eq!(
            store
                .get(&keys::user_session_index("u1"))
                .await
                .expect("index"),
            Some("sess_shared".to_string())
        );
    }

    #[tokio::test]
    async fn invalid_record_writes_nothing() {
        let (service, store, _clock) = service();

        let mut bad = record("u1", 10, 5);
        bad.response_time_ms = f64::NAN;
        assert!(matches!(
            service.capture_metrics(bad).await,
            Err(CaptureError::InvalidRecord(_))
        ));
        assert!(matches!(
            service.capture_metrics(record("  ", 1, 1)).await,
            Err(CaptureError::InvalidRecord(_))
        ));
        assert!(store.scan_keys("*").await.expect("scan").is_empty());
    }

    #[tokio::test]
    async fn capture_records_request_hash_and_hourly_member() {
        let (service, store, _clock) = service();

        let mut tagged = record("u1", 12, 34);
        tagged.request_id = Some("req_fixed".to_string());
        service.capture_metrics(tagged).await.expect("capture");

        let request = store
            .hgetall(&keys::request("req_fixed"))
            .await
            .expect("request hash");
        assert_eq!(request.get("input_tokens").map(String::as_str), Some("12"));
        assert_eq!(request.get("user_id").map(String::as_str), Some("u1"));

        let members = store
            .zrange_with_scores(&keys::user_hourly("u1", start()))
            .await
            .expect("hourly bucket");
        assert_eq!(
            members,
            vec![("req_fixed:input:12:output:34".to_string(), 15.0)]
        );
    }

    #[test]
    fn identity_falls_back_through_hints() {
        let mut hints = IdentityHints {
            header_user_id: Some("alice".to_string()),
            query_user_id: Some("bob".to_string()),
            session_cookie: Some("carol".to_string()),
            forwarded_for: Some("10.0.0.1, 10.0.0.2".to_string()),
            peer_addr: Some("127.0.0.1:5000".to_string()),
        };
        assert_eq!(resolve_user_id(&hints), "alice");

        hints.header_user_id = Some(" ".to_string());
        assert_eq!(resolve_user_id(&hints), "bob");

        hints.query_user_id = None;
        assert_eq!(resolve_user_id(&hints), "carol");

        hints.session_cookie = None;
        assert_eq!(resolve_user_id(&hints), "user_10.0.0.1");

        hints.forwarded_for = None;
        assert_eq!(resolve_user_id(&hints), "user_127.0.0.1_5000");

        hints.peer_addr = None;
        assert_eq!(resolve_user_id(&hints), "user_anonymous");
    }

    #[test]
    fn generated_ids_have_expected_shape() {
        let request_id = generate_request_id();
        assert!(request_id.starts_with("req_"));
        assert_eq!(request_id.len(), 4 + 16);

        let session_id = generate_session_id();
        assert!(session_id.starts_with("sess_"));
        assert_eq!(session_id.len(), 5 + 8);
    }
}
