//! Key-value store seam.
//!
//! Everything the engine persists goes through [`KvStore`]: hashes, sets,
//! sorted sets, plain counters and labelled time series. Writes that belong
//! together are submitted as one [`StoreCommand`] batch and applied
//! atomically, so a capture either lands completely or not at all.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::aggregator::Aggregation;
use crate::types::DataPoint;

pub mod memory;
pub mod redis_store;

pub use self::memory::MemoryStore;
pub use self::redis_store::{RedisConfig, RedisStore};

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("invalid store address: {0}")]
    Address(String),

    #[error("key {0} holds a value of the wrong type")]
    WrongType(String),

    #[error("key {0} already exists")]
    AlreadyExists(String),

    #[error("key {0} does not exist")]
    NotFound(String),

    #[error("invalid pattern: {0}")]
    Pattern(String),

    #[error("unexpected store reply: {0}")]
    InvalidReply(String),

    #[error("increment on {0} would overflow")]
    Overflow(String),
}

/// A single write inside an atomic batch.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreCommand {
    HSet {
        key: String,
        fields: Vec<(String, String)>,
    },
    HSetNx {
        key: String,
        field: String,
        value: String,
    },
    HIncrBy {
        key: String,
        field: String,
        delta: i64,
    },
    HIncrByFloat {
        key: String,
        field: String,
        delta: f64,
    },
    SAdd {
        key: String,
        member: String,
    },
    ZAdd {
        key: String,
        member: String,
        score: f64,
    },
    /// Writes `field = sum(sum_fields) / count_field`, read after every
    /// earlier command in the batch. Skipped while the count is zero.
    HSetMean {
        key: String,
        field: String,
        sum_fields: Vec<String>,
        count_field: String,
    },
    IncrBy {
        key: String,
        delta: i64,
    },
    SetWithTtl {
        key: String,
        value: String,
        ttl: Duration,
    },
    Expire {
        key: String,
        ttl: Duration,
    },
}

impl StoreCommand {
    pub fn key(&self) -> &str {
        match self {
            Self::HSet { key, .. }
            | Self::HSetNx { key, .. }
            | Self::HIncrBy { key, .. }
            | Self::HIncrByFloat { key, .. }
            | Self::SAdd { key, .. }
            | Self::ZAdd { key, .. }
            | Self::HSetMean { key, .. }
            | Self::IncrBy { key, .. }
            | Self::SetWithTtl { key, .. }
            | Self::Expire { key, .. } => key,
        }
    }
}

/// Outcome of binding a user to a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionClaim {
    pub session_id: String,
    pub created: bool,
}

/// Declaration of one time series.
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesSpec {
    pub key: String,
    pub retention: Duration,
    pub labels: BTreeMap<String, String>,
}

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn ping(&self) -> StoreResult<()>;

    /// Applies every command or none of them.
    async fn exec_atomic(&self, commands: Vec<StoreCommand>) -> StoreResult<()>;

    async fn get(&self, key: &str) -> StoreResult<Option<String>>;
    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>>;
    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>>;
    async fn scard(&self, key: &str) -> StoreResult<u64>;
    async fn smembers(&self, key: &str) -> StoreResult<Vec<String>>;

    /// Members with scores, ascending by score.
    async fn zrange_with_scores(&self, key: &str) -> StoreResult<Vec<(String, f64)>>;

    /// Keys matching a glob pattern. Order is unspecified.
    async fn scan_keys(&self, pattern: &str) -> StoreResult<Vec<String>>;

    /// Atomically reads `index_key`, installing `candidate` when it is
    /// absent, and resets the key's TTL to `idle_ttl` either way.
    async fn claim_session(
        &self,
        index_key: &str,
        candidate: &str,
        idle_ttl: Duration,
    ) -> StoreResult<SessionClaim>;

    /// Deletes `index_key` only while it still points at `session_id`.
    /// Returns whether the binding was removed.
    async fn release_session(&self, index_key: &str, session_id: &str) -> StoreResult<bool>;

    /// Fails with [`StoreError::AlreadyExists`] when the series is present;
    /// the existing series is left untouched.
    async fn ts_create(&self, spec: &SeriesSpec) -> StoreResult<()>;

    /// Appends a sample, replacing any sample at the same timestamp.
    async fn ts_add(&self, key: &str, timestamp_ms: i64, value: f64) -> StoreResult<()>;

    async fn ts_range(
        &self,
        key: &str,
        start_ms: i64,
        end_ms: i64,
        aggregation: Option<(Aggregation, i64)>,
    ) -> StoreResult<Vec<DataPoint>>;

    async fn ts_get(&self, key: &str) -> StoreResult<Option<DataPoint>>;
}
