use std::collections::BTreeMap;
use std::sync::Arc;

use crate::clock::{Clock, SystemClock};
use crate::config::AnalyticsConfig;
use crate::keys::{self, ActivityWindow};
use crate::store::{KvStore, StoreResult};
use crate::timeseries::{self, TimeSeriesStore};
use crate::types::{
    AnalyticsSnapshot, GaugeSnapshot, ModelStats, RequestStatus, SessionAggregate, UserStats,
};

/// Read side of the engine: publishes gauges and answers snapshot queries.
pub struct AnalyticsService {
    store: Arc<dyn KvStore>,
    series: Arc<TimeSeriesStore>,
    clock: Arc<dyn Clock>,
    config: AnalyticsConfig,
}

impl AnalyticsService {
    pub fn new(
        store: Arc<dyn KvStore>,
        series: Arc<TimeSeriesStore>,
        config: AnalyticsConfig,
    ) -> Self {
        Self::with_clock(store, series, Arc::new(SystemClock), config)
    }

    pub fn with_clock(
        store: Arc<dyn KvStore>,
        series: Arc<TimeSeriesStore>,
        clock: Arc<dyn Clock>,
        config: AnalyticsConfig,
    ) -> Self {
        Self {
            store,
            series,
            clock,
            config,
        }
    }

    /// Reads the current aggregate state and publishes it as gauges.
    pub async fn refresh_gauges(&self) -> StoreResult<GaugeSnapshot> {
        let mut snapshot = GaugeSnapshot::default();

        for window in ActivityWindow::ALL {
            let count = self.store.scard(&window.key()).await?;
            metrics::gauge!("token_analytics_active_users", "window" => window.label())
                .set(count as f64);
            snapshot.active_users.insert(window.label().to_string(), count);
        }

        snapshot.active_sessions = self.store.scard(keys::ACTIVE_SESSIONS).await?;
        metrics::gauge!("token_analytics_active_sessions").set(snapshot.active_sessions as f64);

        snapshot.model_usage = self.model_usage().await?;
        for (model, stats) in &snapshot.model_usage {
            let values = [
                ("total_requests", stats.total_requests as f64),
                ("total_input_tokens", stats.total_input_tokens as f64),
                ("total_output_tokens", stats.total_output_tokens as f64),
                ("avg_response_time", stats.avg_response_time),
                ("avg_tokens_per_second", stats.avg_tokens_per_second),
            ];
            for (metric, value) in values {
                metrics::gauge!(
                    "token_analytics_model_usage",
                    "model" => model.clone(),
                    "metric" => metric
                )
                .set(value);
            }
        }

        for kind in RequestStatus::ERROR_KINDS {
            let count = self
                .store
                .get(&keys::error_counter(kind.as_str()))
                .await?
                .and_then(|raw| raw.parse::<u64>().ok())
                .unwrap_or(0);
            metrics::gauge!("token_analytics_error_count", "error_type" => kind.as_str())
                .set(count as f64);
            snapshot.error_counts.insert(kind.as_str().to_string(), count);
        }

        log::debug!(
            "Refreshed gauges: {} active sessions, {} models",
            snapshot.active_sessions,
            snapshot.model_usage.len()
        );
        Ok(snapshot)
    }

    pub async fn get_analytics(&self) -> StoreResult<AnalyticsSnapshot> {
        let active_users_5m = self.store.scard(&ActivityWindow::FiveMinutes.key()).await?;
        let active_users_1h = self.store.scard(&ActivityWindow::OneHour.key()).await?;
        let active_sessions = self.store.scard(keys::ACTIVE_SESSIONS).await?;

        let mut token_rates = BTreeMap::new();
        token_rates.insert(
            "input_per_minute".to_string(),
            self.latest(timeseries::TOKENS_INPUT_RATE).await,
        );
        token_rates.insert(
            "output_per_minute".to_string(),
            self.latest(timeseries::TOKENS_OUTPUT_RATE).await,
        );

        Ok(AnalyticsSnapshot {
            active_users_5m,
            active_users_1h,
            active_sessions,
            token_rates,
            top_users: self.top_users().await?,
            model_usage: self.model_usage().await?,
            response_time_p95: self.latest(timeseries::RESPONSE_TIME_P95).await,
            response_time_p99: self.latest(timeseries::RESPONSE_TIME_P99).await,
            error_rate: self.latest(timeseries::ERROR_RATE).await,
            timestamp: self.clock.now().timestamp(),
        })
    }

    /// Users ranked by total tokens, heaviest first; ties go to the lower id.
    pub async fn top_users(&self) -> StoreResult<Vec<UserStats>> {
        let mut users = Vec::new();
        for key in self.store.scan_keys(keys::USER_AGGREGATE_PATTERN).await? {
            let Some(user_id) = keys::user_id_from_key(&key) else {
                continue;
            };
            let fields = self.store.hgetall(&key).await?;
            users.push(UserStats::from_fields(user_id, &fields));
        }

        users.sort_by(|a, b| {
            b.total_tokens()
                .cmp(&a.total_tokens())
                .then_with(|| a.user_id.cmp(&b.user_id))
        });
        users.truncate(self.config.top_users_limit);
        Ok(users)
    }

    pub async fn model_usage(&self) -> StoreResult<BTreeMap<String, ModelStats>> {
        let mut models = BTreeMap::new();
        for key in self.store.scan_keys(keys::MODEL_AGGREGATE_PATTERN).await? {
            let Some(model) = keys::model_from_key(&key) else {
                continue;
            };
            let fields = self.store.hgetall(&key).await?;
            models.insert(model.to_string(), ModelStats::from_fields(&fields));
        }
        Ok(models)
    }

    pub async fn session(&self, session_id: &str) -> StoreResult<Option<SessionAggregate>> {
        let fields = self.store.hgetall(&keys::session(session_id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        Ok(Some(SessionAggregate::from_fields(session_id, &fields)))
    }

    async fn latest(&self, key: &str) -> f64 {
        self.series.latest_or_none(key).await.unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{Duration, TimeZone, Utc};

    use super::*;
    use crate::capture::CaptureService;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use crate::types::TokenMetrics;

    struct Harness {
        capture: CaptureService,
        analytics: AnalyticsService,
        series: Arc<TimeSeriesStore>,
        clock: ManualClock,
    }

    fn harness(config: AnalyticsConfig) -> Harness {
        let clock = ManualClock::new(
            Utc.with_ymd_and_hms(2026, 2, 10, 10, 0, 0)
                .single()
                .expect("valid datetime"),
        );
        let shared: Arc<dyn Clock> = Arc::new(clock.clone());
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::with_clock(shared.clone()));
        let series = Arc::new(TimeSeriesStore::with_clock(store.clone(), shared.clone()));

        Harness {
            capture: CaptureService::with_clock(store.clone(), shared.clone(), config.clone()),
            analytics: AnalyticsService::with_clock(store, series.clone(), shared, config),
            series,
            clock,
        }
    }

    fn record(user_id: &str, model: &str, input: u64, output: u64, status: &str) -> TokenMetrics {
        TokenMetrics {
            user_id: user_id.to_string(),
            model_used: model.to_string(),
            input_tokens: input,
            output_tokens: output,
            response_time_ms: 500.0,
            status: status.to_string(),
            ..TokenMetrics::default()
        }
    }

    #[tokio::test]
    async fn refresh_reports_windows_sessions_models_and_errors() {
        let h = harness(AnalyticsConfig::default());
        for (user, status) in [("u1", "success"), ("u2", "rate_limit"), ("u2", "timeout")] {
            h.capture
                .capture_metrics(record(user, "llama3:8b", 10, 10, status))
                .await
                .expect("capture");
        }

        let snapshot = h.analytics.refresh_gauges().await.expect("refresh");
        assert_eq!(snapshot.active_users.get("5m"), Some(&2));
        assert_eq!(snapshot.active_users.get("24h"), Some(&2));
        assert_eq!(snapshot.active_sessions, 2);
        assert_eq!(snapshot.model_usage["llama3:8b"].total_requests, 3);
        assert_eq!(snapshot.model_usage["llama3:8b"].avg_response_time, 500.0);
        assert_eq!(snapshot.error_counts.get("rate_limit"), Some(&1));
        assert_eq!(snapshot.error_counts.get("timeout"), Some(&1));
        assert_eq!(snapshot.error_counts.get("error"), Some(&0));

        h.clock.advance(Duration::minutes(6));
        let later = h.analytics.refresh_gauges().await.expect("refresh");
        assert_eq!(later.active_users.get("5m"), Some(&0));
        assert_eq!(later.active_users.get("15m"), Some(&2));
    }

    #[tokio::test]
    async fn top_users_are_ranked_by_total_tokens_with_id_tiebreak() {
        let mut config = AnalyticsConfig::default();
        config.top_users_limit = 2;
        let h = harness(config);

        for (user, input) in [("carol", 50), ("bob", 100), ("alice", 100), ("dave", 5)] {
            h.capture
                .capture_metrics(record(user, "m", input, 0, "success"))
                .await
                .expect("capture");
        }

        let top = h.analytics.top_users().await.expect("top users");
        assert_eq!(top[0].total_sessions, 1);
        let ids: Vec<&str> = top.iter().map(|u| u.user_id.as_str()).collect();
        assert_eq!(ids, vec!["alice", "bob"]);
    }

    #[tokio::test]
    async fn snapshot_defaults_rates_to_zero_until_rollup_runs() {
        let h = harness(AnalyticsConfig::default());
        h.series.initialize().await.expect("initialize");
        h.capture
            .capture_metrics(record("u1", "m", 60, 30, "success"))
            .await
            .expect("capture");

        let before = h.analytics.get_analytics().await.expect("analytics");
        assert_eq!(before.active_users_5m, 1);
        assert_eq!(before.active_users_1h, 1);
        assert_eq!(before.active_sessions, 1);
        assert_eq!(before.token_rates.get("input_per_minute"), Some(&0.0));
        assert_eq!(before.response_time_p95, 0.0);
        assert_eq!(before.top_users.len(), 1);
        assert_eq!(before.top_users[0].avg_tokens_per_request, 90.0);
        assert_eq!(before.timestamp, h.clock.now().timestamp());

        h.series.run_rollup().await.expect("rollup");
        h.clock.advance(Duration::minutes(1));
        let receipt = h
            .capture
            .capture_metrics(record("u1", "m", 60, 30, "error"))
            .await
            .expect("capture");

        let session = h
            .analytics
            .session(&receipt.session_id)
            .await
            .expect("session")
            .expect("session exists");
        assert_eq!(session.user_id, "u1");
        assert_eq!(session.request_count, 2);
        assert_eq!(session.total_input_tokens, 120);
        assert_eq!(session.avg_response_time, 500.0);
        assert_eq!(session.status, "active");
        assert!(h.analytics.session("sess_missing").await.expect("lookup").is_none());
        h.series.run_rollup().await.expect("rollup");

        let after = h.analytics.get_analytics().await.expect("analytics");
        assert_eq!(after.token_rates.get("input_per_minute"), Some(&60.0));
        assert_eq!(after.token_rates.get("output_per_minute"), Some(&30.0));
        assert_eq!(after.response_time_p95, 500.0);
        assert_eq!(after.error_rate, 1.0);
    }
}
