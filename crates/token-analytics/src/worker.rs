use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use log::{debug, info, warn};
use tokio::task::JoinHandle;

use crate::analytics::AnalyticsService;
use crate::timeseries::TimeSeriesStore;

/// Background loops: the gauge refresh and the time-series rollup.
///
/// Both loops share one running flag. A failed cycle is logged and the loop
/// keeps going.
pub struct AnalyticsWorker {
    analytics: Arc<AnalyticsService>,
    series: Arc<TimeSeriesStore>,
    refresh_interval: Duration,
    rollup_interval: Duration,
    running: Arc<AtomicBool>,
}

impl AnalyticsWorker {
    pub fn new(
        analytics: Arc<AnalyticsService>,
        series: Arc<TimeSeriesStore>,
        refresh_interval: Duration,
        rollup_interval: Duration,
    ) -> Self {
        Self {
            analytics,
            series,
            refresh_interval,
            rollup_interval,
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Spawns the gauge refresh loop.
    pub fn spawn_refresh(&self) -> JoinHandle<()> {
        let analytics = Arc::clone(&self.analytics);
        let running = Arc::clone(&self.running);
        let period = self.refresh_interval;

        tokio::spawn(async move {
            info!("Gauge refresh started (every {:?})", period);
            let mut ticker = tokio::time::interval(period);
            while running.load(Ordering::SeqCst) {
                ticker.tick().await;
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                if let Err(e) = refresh_once(&analytics).await {
                    warn!("Gauge refresh failed: {:#}", e);
                }
            }
            info!("Gauge refresh stopped");
        })
    }

    /// Spawns the time-series rollup loop.
    pub fn spawn_rollup(&self) -> JoinHandle<()> {
        let series = Arc::clone(&self.series);
        let running = Arc::clone(&self.running);
        let period = self.rollup_interval;

        tokio::spawn(async move {
            info!("Time series rollup started (every {:?})", period);
            let mut ticker = tokio::time::interval(period);
            while running.load(Ordering::SeqCst) {
                ticker.tick().await;
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                if let Err(e) = rollup_once(&series).await {
                    warn!("Time series rollup failed: {:#}", e);
                }
            }
            info!("Time series rollup stopped");
        })
    }

    pub fn running(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

async fn refresh_once(analytics: &AnalyticsService) -> anyhow::Result<()> {
    let snapshot = analytics
        .refresh_gauges()
        .await
        .context("reading aggregate state")?;
    debug!(
        "Gauges: {:?} users, {} sessions",
        snapshot.active_users, snapshot.active_sessions
    );
    Ok(())
}

async fn rollup_once(series: &TimeSeriesStore) -> anyhow::Result<()> {
    let written = series.run_rollup().await.context("sampling rollup sources")?;
    if written.len() < series.catalog().len() {
        warn!(
            "Rollup wrote {} of {} series",
            written.len(),
            series.catalog().len()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::time::Duration;

    use super::AnalyticsWorker;
    use crate::analytics::AnalyticsService;
    use crate::config::AnalyticsConfig;
    use crate::store::{KvStore, MemoryStore};
    use crate::timeseries::{TimeSeriesStore, SESSIONS_ACTIVE};

    #[tokio::test]
    async fn loops_sample_until_stopped() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let series = Arc::new(TimeSeriesStore::new(store.clone()));
        series.initialize().await.expect("initialize");
        let analytics = Arc::new(AnalyticsService::new(
            store,
            series.clone(),
            AnalyticsConfig::default(),
        ));

        let worker = AnalyticsWorker::new(
            analytics,
            series.clone(),
            Duration::from_millis(10),
            Duration::from_millis(10),
        );
        let refresh = worker.spawn_refresh();
        let rollup = worker.spawn_rollup();

        tokio::time::sleep(Duration::from_millis(50)).await;
        worker.stop();
        assert!(!worker.running().load(Ordering::SeqCst));

        tokio::time::timeout(Duration::from_secs(1), async {
            refresh.await.expect("refresh task");
            rollup.await.expect("rollup task");
        })
        .await
        .expect("loops exit after stop");

        let latest = series
            .get_latest_value(SESSIONS_ACTIVE)
            .await
            .expect("rollup wrote a sample");
        assert_eq!(latest.value, 0.0);
    }
}
