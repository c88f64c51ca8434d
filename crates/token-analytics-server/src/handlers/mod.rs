pub mod analytics;
pub mod capture;
pub mod classify;
pub mod health;
pub mod metrics;
pub mod timeseries;
