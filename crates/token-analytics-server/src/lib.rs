pub mod error;
pub mod handlers;
pub mod logging;
pub mod server;
pub mod state;

pub use error::AppError;
pub use server::{app_config, routes, run_server};
pub use state::{AppState, ServiceRole};
