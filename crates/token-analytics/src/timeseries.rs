//! Named time series with retention and labels.
//!
//! The catalog is fixed at startup. Every entry declares where its samples
//! come from, and [`TimeSeriesStore::run_rollup`] walks the whole catalog
//! once per cycle so no series is left without data.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::aggregator::{percentile, Aggregation};
use crate::clock::{Clock, SystemClock};
use crate::keys;
use crate::store::{KvStore, SeriesSpec, StoreError};
use crate::types::DataPoint;

pub const TOKENS_INPUT_RATE: &str = "metrics:tokens:input_rate";
pub const TOKENS_OUTPUT_RATE: &str = "metrics:tokens:output_rate";
pub const USERS_ACTIVE_5M: &str = "metrics:users:active_5m";
pub const USERS_ACTIVE_1H: &str = "metrics:users:active_1h";
pub const USERS_ACTIVE_24H: &str = "metrics:users:active_24h";
pub const SESSIONS_ACTIVE: &str = "metrics:sessions:active";
pub const RESPONSE_TIME_P95: &str = "metrics:response_time:p95";
pub const RESPONSE_TIME_P99: &str = "metrics:response_time:p99";
pub const ERROR_RATE: &str = "metrics:error_rate";

const DAY: Duration = Duration::from_secs(24 * 60 * 60);
const WEEK: Duration = Duration::from_secs(7 * 24 * 60 * 60);

#[derive(Debug, Error)]
pub enum TimeSeriesError {
    #[error("series {0} not found")]
    NotFound(String),

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("query for {key} failed: {source}")]
    Query {
        key: String,
        #[source]
        source: StoreError,
    },

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl TimeSeriesError {
    fn for_key(key: &str, error: StoreError) -> Self {
        match error {
            StoreError::NotFound(_) => Self::NotFound(key.to_string()),
            source => Self::Query {
                key: key.to_string(),
                source,
            },
        }
    }
}

/// Where the rollup reads a series' next sample from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeriesSource {
    /// Per-minute increase of an integer counter since the previous cycle.
    CounterRate(&'static str),
    /// Cardinality of a set.
    SetSize(&'static str),
    /// Percentile of the previous minute's latency bucket.
    LatencyPercentile(u8),
    /// Errors over requests since the previous cycle.
    ErrorRate,
}

#[derive(Debug, Clone)]
pub struct SeriesDefinition {
    pub key: &'static str,
    pub retention: Duration,
    pub labels: &'static [(&'static str, &'static str)],
    pub source: SeriesSource,
}

impl SeriesDefinition {
    pub fn labels(&self) -> BTreeMap<String, String> {
        self.labels
            .iter()
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect()
    }

    fn spec(&self) -> SeriesSpec {
        SeriesSpec {
            key: self.key.to_string(),
            retention: self.retention,
            labels: self.labels(),
        }
    }
}

pub fn catalog() -> Vec<SeriesDefinition> {
    vec![
        SeriesDefinition {
            key: TOKENS_INPUT_RATE,
            retention: DAY,
            labels: &[("metric_type", "token_rate"), ("direction", "input")],
            source: SeriesSource::CounterRate(keys::INPUT_TOKENS_COUNTER),
        },
        SeriesDefinition {
            key: TOKENS_OUTPUT_RATE,
            retention: DAY,
            labels: &[("metric_type", "token_rate"), ("direction", "output")],
            source: SeriesSource::CounterRate(keys::OUTPUT_TOKENS_COUNTER),
        },
        SeriesDefinition {
            key: USERS_ACTIVE_5M,
            retention: DAY,
            labels: &[("metric_type", "user_activity"), ("window", "5m")],
            source: SeriesSource::SetSize("users:active:5m"),
        },
        SeriesDefinition {
            key: USERS_ACTIVE_1H,
            retention: DAY,
            labels: &[("metric_type", "user_activity"), ("window", "1h")],
            source: SeriesSource::SetSize("users:active:1h"),
        },
        SeriesDefinition {
            key: USERS_ACTIVE_24H,
            retention: WEEK,
            labels: &[("metric_type", "user_activity"), ("window", "24h")],
            source: SeriesSource::SetSize("users:active:24h"),
        },
        SeriesDefinition {
            key: SESSIONS_ACTIVE,
            retention: WEEK,
            labels: &[("metric_type", "session_activity")],
            source: SeriesSource::SetSize(keys::ACTIVE_SESSIONS),
        },
        SeriesDefinition {
            key: RESPONSE_TIME_P95,
            retention: DAY,
            labels: &[("metric_type", "response_time"), ("percentile", "95")],
            source: SeriesSource::LatencyPercentile(95),
        },
        SeriesDefinition {
            key: RESPONSE_TIME_P99,
            retention: DAY,
            labels: &[("metric_type", "response_time"), ("percentile", "99")],
            source: SeriesSource::LatencyPercentile(99),
        },
        SeriesDefinition {
            key: ERROR_RATE,
            retention: DAY,
            labels: &[("metric_type", "error_rate")],
            source: SeriesSource::ErrorRate,
        },
    ]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeriesQuery {
    pub key: String,
    pub start_time: i64,
    pub end_time: i64,
    #[serde(default)]
    pub aggregation: Option<Aggregation>,
    /// Bucket width in milliseconds.
    #[serde(default)]
    pub bucket_duration: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeriesResponse {
    pub key: String,
    pub data: Vec<DataPoint>,
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
struct RollupState {
    last_run: Option<DateTime<Utc>>,
    counters: HashMap<&'static str, i64>,
}

pub struct TimeSeriesStore {
    store: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    catalog: Vec<SeriesDefinition>,
    rollup: Mutex<RollupState>,
}

impl TimeSeriesStore {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    pub fn with_clock(store: Arc<dyn KvStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            catalog: catalog(),
            rollup: Mutex::new(RollupState::default()),
        }
    }

    pub fn catalog(&self) -> &[SeriesDefinition] {
        &self.catalog
    }

    /// Creates every catalog series. Series that already exist keep their
    /// data. Returns how many were newly created.
    pub async fn initialize(&self) -> Result<usize, TimeSeriesError> {
        let mut created = 0;
        for definition in &self.catalog {
            match self.store.ts_create(&definition.spec()).await {
                Ok(()) => {
                    created += 1;
                    log::debug!("Created time series {}", definition.key);
                }
                Err(StoreError::AlreadyExists(_)) => {
                    log::debug!("Time series {} already exists", definition.key);
                }
                Err(error) => return Err(TimeSeriesError::for_key(definition.key, error)),
            }
        }

        log::info!(
            "Time series catalog ready ({} series, {} created)",
            self.catalog.len(),
            created
        );
        Ok(created)
    }

    /// Appends a sample. A zero timestamp means now.
    pub async fn add_data_point(
        &self,
        key: &str,
        timestamp: i64,
        value: f64,
    ) -> Result<DataPoint, TimeSeriesError> {
        let started = Instant::now();
        let result = self.add_inner(key, timestamp, value).await;
        record_operation("add", started, result.is_ok());
        result
    }

    async fn add_inner(
        &self,
        key: &str,
        timestamp: i64,
        value: f64,
    ) -> Result<DataPoint, TimeSeriesError> {
        if key.trim().is_empty() {
            return Err(TimeSeriesError::InvalidQuery("key is required".to_string()));
        }
        if !value.is_finite() {
            return Err(TimeSeriesError::InvalidQuery(format!(
                "value for {} must be finite",
                key
            )));
        }

        let timestamp = if timestamp == 0 {
            self.clock.now().timestamp_millis()
        } else {
            timestamp
        };
        self.store
            .ts_add(key, timestamp, value)
            .await
            .map_err(|error| TimeSeriesError::for_key(key, error))?;

        Ok(DataPoint { timestamp, value })
    }

    pub async fn query_range(
        &self,
        query: &TimeSeriesQuery,
    ) -> Result<TimeSeriesResponse, TimeSeriesError> {
        let started = Instant::now();
        let result = self.range_inner(query).await;
        record_operation("range", started, result.is_ok());
        result
    }

    async fn range_inner(&self, query: &TimeSeriesQuery) -> Result<TimeSeriesResponse, TimeSeriesError> {
        if query.key.trim().is_empty() {
            return Err(TimeSeriesError::InvalidQuery("key is required".to_string()));
        }

        let aggregation = match (query.aggregation, query.bucket_duration) {
            (Some(aggregation), Some(bucket)) if bucket > 0 => Some((aggregation, bucket)),
            _ => None,
        };

        let data = self
            .store
            .ts_range(&query.key, query.start_time, query.end_time, aggregation)
            .await
            .map_err(|error| TimeSeriesError::for_key(&query.key, error))?;

        Ok(TimeSeriesResponse {
            key: query.key.clone(),
            data,
            labels: self.labels_for(&query.key),
        })
    }

    /// Runs the queries one after another. The first failure aborts the whole
    /// call.
    pub async fn query_multi_range(
        &self,
        queries: &[TimeSeriesQuery],
    ) -> Result<BTreeMap<String, TimeSeriesResponse>, TimeSeriesError> {
        let started = Instant::now();
        let mut responses = BTreeMap::new();
        for query in queries {
            match self.range_inner(query).await {
                Ok(response) => {
                    responses.insert(query.key.clone(), response);
                }
                Err(error) => {
                    record_operation("multi_range", started, false);
                    return Err(error);
                }
            }
        }
        record_operation("multi_range", started, true);
        Ok(responses)
    }

    pub async fn get_latest_value(&self, key: &str) -> Result<DataPoint, TimeSeriesError> {
        let started = Instant::now();
        let result = self
            .store
            .ts_get(key)
            .await
            .map_err(|error| TimeSeriesError::for_key(key, error))
            .and_then(|point| point.ok_or_else(|| TimeSeriesError::NotFound(key.to_string())));
        record_operation("get", started, result.is_ok());
        result
    }

    /// Latest sample value, or `None` when the series is missing or empty.
    pub async fn latest_or_none(&self, key: &str) -> Option<f64> {
        match self.store.ts_get(key).await {
            Ok(point) => point.map(|point| point.value),
            Err(StoreError::NotFound(_)) => None,
            Err(error) => {
                log::warn!("Failed to read latest value of {}: {}", key, error);
                None
            }
        }
    }

    fn labels_for(&self, key: &str) -> BTreeMap<String, String> {
        self.catalog
            .iter()
            .find(|definition| definition.key == key)
            .map(SeriesDefinition::labels)
            .unwrap_or_default()
    }

    /// Samples every catalog series once. Series whose source cannot be read
    /// are skipped for this cycle. Returns the values written, by key.
    pub async fn run_rollup(&self) -> Result<BTreeMap<String, f64>, TimeSeriesError> {
        let now = self.clock.now();

        let mut current = HashMap::new();
        for counter in self.counter_keys() {
            let raw = self.store.get(counter).await?;
            let value = raw.and_then(|v| v.parse::<i64>().ok()).unwrap_or(0);
            current.insert(counter, value);
        }

        let (previous, last_run) = {
            let mut state = self.rollup.lock();
            let previous = std::mem::replace(&mut state.counters, current.clone());
            let last_run = state.last_run.replace(now);
            (previous, last_run)
        };
        let elapsed_minutes = last_run
            .map(|at| (now - at).num_milliseconds() as f64 / 60_000.0)
            .filter(|minutes| *minutes > 0.0);

        let delta = |counter: &'static str| -> Option<f64> {
            let before = previous.get(counter)?;
            let after = current.get(counter)?;
            Some(after.saturating_sub(*before).max(0) as f64)
        };

        let mut written = BTreeMap::new();
        for definition in &self.catalog {
            let value = match definition.source {
                SeriesSource::CounterRate(counter) => match (delta(counter), elapsed_minutes) {
                    (Some(increase), Some(minutes)) => Ok(increase / minutes),
                    _ => Ok(0.0),
                },
                SeriesSource::SetSize(set) => self.store.scard(set).await.map(|size| size as f64),
                SeriesSource::LatencyPercentile(percent) => {
                    self.previous_minute_percentile(now, percent).await
                }
                SeriesSource::ErrorRate => {
                    let requests = delta(keys::REQUESTS_COUNTER).unwrap_or(0.0);
                    let errors = delta(keys::ERRORS_COUNTER).unwrap_or(0.0);
                    Ok(if requests > 0.0 { errors / requests } else { 0.0 })
                }
            };

            let value = match value {
                Ok(value) => value,
                Err(error) => {
                    log::warn!("Rollup source for {} failed: {}", definition.key, error);
                    continue;
                }
            };

            match self
                .add_data_point(definition.key, now.timestamp_millis(), value)
                .await
            {
                Ok(_) => {
                    written.insert(definition.key.to_string(), value);
                }
                Err(error) => {
                    log::warn!("Rollup write to {} failed: {}", definition.key, error);
                }
            }
        }

        log::debug!("Rollup wrote {} samples", written.len());
        Ok(written)
    }

    fn counter_keys(&self) -> Vec<&'static str> {
        let mut counters = vec![keys::REQUESTS_COUNTER, keys::ERRORS_COUNTER];
        for definition in &self.catalog {
            if let SeriesSource::CounterRate(counter) = definition.source {
                counters.push(counter);
            }
        }
        counters.sort_unstable();
        counters.dedup();
        counters
    }

    async fn previous_minute_percentile(
        &self,
        now: DateTime<Utc>,
        percent: u8,
    ) -> Result<f64, StoreError> {
        let bucket = keys::latency_bucket(now - chrono::Duration::minutes(1));
        let samples: Vec<f64> = self
            .store
            .zrange_with_scores(&bucket)
            .await?
            .into_iter()
            .map(|(_, score)| score)
            .collect();
        Ok(percentile(&samples, f64::from(percent) / 100.0).unwrap_or(0.0))
    }
}

fn record_operation(operation: &'static str, started: Instant, ok: bool) {
    let status = if ok { "success" } else { "error" };
    metrics::counter!(
        "timeseries_operations_total",
        "operation" => operation,
        "status" => status
    )
    .increment(1);
    metrics::histogram!(
        "timeseries_operation_duration_seconds",
        "operation" => operation
    )
    .record(started.elapsed().as_secs_f64());
}
