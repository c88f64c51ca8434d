//! Engine tunables.
//!
//! Loaded from environment variables with fallback to defaults.

use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalyticsConfig {
    /// Period of the gauge refresh loop.
    pub refresh_interval: Duration,
    /// Period of the time-series rollup loop.
    pub rollup_interval: Duration,
    /// How long a user's session binding survives without captures.
    pub session_idle: Duration,
    pub top_users_limit: usize,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(10),
            rollup_interval: Duration::from_secs(30),
            session_idle: Duration::from_secs(30 * 60),
            top_users_limit: 10,
        }
    }
}

impl AnalyticsConfig {
    /// Environment variables:
    /// - `ANALYTICS_REFRESH_SECS`: gauge refresh period (default: 10)
    /// - `TIMESERIES_ROLLUP_SECS`: rollup period (default: 30)
    /// - `SESSION_IDLE_MINUTES`: session reuse window (default: 30)
    /// - `TOP_USERS_LIMIT`: users returned by the analytics snapshot (default: 10)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            refresh_interval: env_u64("ANALYTICS_REFRESH_SECS")
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.refresh_interval),
            rollup_interval: env_u64("TIMESERIES_ROLLUP_SECS")
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.rollup_interval),
            session_idle: env_u64("SESSION_IDLE_MINUTES")
                .filter(|minutes| *minutes > 0)
                .map(|minutes| Duration::from_secs(minutes * 60))
                .unwrap_or(defaults.session_idle),
            top_users_limit: std::env::var("TOP_USERS_LIMIT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.top_users_limit),
        }
    }
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}
