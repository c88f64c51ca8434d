pub mod aggregator;
pub mod analytics;
pub mod capture;
pub mod classifier;
pub mod clock;
pub mod config;
pub mod keys;
pub mod store;
pub mod timeseries;
pub mod types;
pub mod worker;

pub use aggregator::{aggregate_buckets, percentile, Aggregation};
pub use analytics::AnalyticsService;
pub use capture::{
    generate_request_id, generate_session_id, resolve_user_id, CaptureError, CaptureService,
    CaptureStage, IdentityHints,
};
pub use classifier::{ClassificationRule, TaskCategory, TaskClassification, TaskClassifier};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::AnalyticsConfig;
pub use store::{
    KvStore, MemoryStore, RedisConfig, RedisStore, SeriesSpec, SessionClaim, StoreCommand,
    StoreError, StoreResult,
};
pub use timeseries::{
    SeriesDefinition, SeriesSource, TimeSeriesError, TimeSeriesQuery, TimeSeriesResponse,
    TimeSeriesStore,
};
pub use types::{
    AnalyticsSnapshot, CaptureReceipt, DataPoint, GaugeSnapshot, ModelStats, RequestStatus,
    SessionAggregate, TokenMetrics, UserStats,
};
pub use worker::AnalyticsWorker;
