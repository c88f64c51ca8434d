use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusHandle;
use token_analytics::{
    AnalyticsConfig, AnalyticsService, AnalyticsWorker, CaptureService, KvStore, TaskClassifier,
    TimeSeriesStore,
};

/// Which route groups and background loops a process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ServiceRole {
    All,
    Capture,
    Analytics,
    Timeseries,
}

impl ServiceRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Capture => "capture",
            Self::Analytics => "analytics",
            Self::Timeseries => "timeseries",
        }
    }

    pub fn service_name(self) -> &'static str {
        match self {
            Self::All => "token-analytics",
            Self::Capture => "token-capture",
            Self::Analytics => "token-analytics-query",
            Self::Timeseries => "timeseries",
        }
    }

    pub fn serves_capture(self) -> bool {
        matches!(self, Self::All | Self::Capture)
    }

    pub fn serves_analytics(self) -> bool {
        matches!(self, Self::All | Self::Analytics)
    }

    pub fn serves_timeseries(self) -> bool {
        matches!(self, Self::All | Self::Timeseries)
    }
}

pub struct AppState {
    pub role: ServiceRole,
    pub store: Arc<dyn KvStore>,
    pub capture: Arc<CaptureService>,
    pub analytics: Arc<AnalyticsService>,
    pub series: Arc<TimeSeriesStore>,
    pub classifier: TaskClassifier,
    pub prometheus: PrometheusHandle,
    pub config: AnalyticsConfig,
}

impl AppState {
    pub fn new(
        role: ServiceRole,
        store: Arc<dyn KvStore>,
        config: AnalyticsConfig,
        prometheus: PrometheusHandle,
    ) -> Self {
        let series = Arc::new(TimeSeriesStore::new(store.clone()));
        let capture = Arc::new(CaptureService::new(store.clone(), config.clone()));
        let analytics = Arc::new(AnalyticsService::new(
            store.clone(),
            series.clone(),
            config.clone(),
        ));

        Self {
            role,
            store,
            capture,
            analytics,
            series,
            classifier: TaskClassifier::default(),
            prometheus,
            config,
        }
    }

    /// Starts the loops this role is responsible for.
    pub fn spawn_worker(&self) -> AnalyticsWorker {
        let worker = AnalyticsWorker::new(
            self.analytics.clone(),
            self.series.clone(),
            self.config.refresh_interval,
            self.config.rollup_interval,
        );
        if self.role.serves_analytics() {
            worker.spawn_refresh();
        }
        if self.role.serves_timeseries() {
            worker.spawn_rollup();
        }
        worker
    }
}
