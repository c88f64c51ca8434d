use std::io;
use std::sync::Arc;

use actix_web::web;
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use token_analytics::{AnalyticsConfig, KvStore, MemoryStore, RedisConfig, RedisStore};
use token_analytics_server::logging::init_logging;
use token_analytics_server::{run_server, AppState, ServiceRole};

#[derive(Parser, Debug, Clone)]
#[command(name = "token-analytics-server")]
#[command(about = "Token usage analytics HTTP server")]
#[command(version)]
struct Cli {
    /// Enable debug mode
    #[arg(long, env = "DEBUG", default_value = "false")]
    debug: bool,

    /// Server port
    #[arg(long, env = "PORT", default_value = "8081")]
    port: u16,

    /// Route groups and background loops to run
    #[arg(long, env = "ANALYTICS_ROLE", value_enum, default_value = "all")]
    role: ServiceRole,

    /// Key-value backend
    #[arg(long, env = "ANALYTICS_STORE", value_enum, default_value = "redis")]
    store: StoreKind,

    /// Redis host:port
    #[arg(long, env = "REDIS_ADDR", default_value = "localhost:6379")]
    redis_addr: String,

    /// Redis password
    #[arg(long, env = "REDIS_PASSWORD")]
    redis_password: Option<String>,

    /// Redis database index
    #[arg(long, env = "REDIS_DB", default_value = "0")]
    redis_db: i64,

    /// Log level (overrides debug flag)
    #[arg(long, env = "RUST_LOG")]
    log_level: Option<String>,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum StoreKind {
    Redis,
    Memory,
}

fn startup_error(context: &str, error: impl std::fmt::Display) -> io::Error {
    log::error!("{}: {}", context, error);
    io::Error::new(io::ErrorKind::Other, format!("{}: {}", context, error))
}

async fn connect_store(cli: &Cli) -> io::Result<Arc<dyn KvStore>> {
    let store: Arc<dyn KvStore> = match cli.store {
        StoreKind::Memory => {
            log::warn!("Using the in-memory store; data is lost on exit");
            Arc::new(MemoryStore::new())
        }
        StoreKind::Redis => {
            let config = RedisConfig {
                addr: cli.redis_addr.clone(),
                password: cli.redis_password.clone(),
                db: cli.redis_db,
            };
            let store = RedisStore::connect(&config)
                .await
                .map_err(|e| startup_error("Failed to connect to redis", e))?;
            Arc::new(store)
        }
    };

    store
        .ping()
        .await
        .map_err(|e| startup_error("Store is not reachable", e))?;
    Ok(store)
}

#[actix_web::main]
async fn main() -> io::Result<()> {
    let cli = Cli::parse();

    init_logging(cli.debug, cli.log_level.as_deref());

    log::info!(
        "Starting token analytics server on port {} (role: {}, store: {:?})",
        cli.port,
        cli.role.as_str(),
        cli.store
    );

    let prometheus = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| startup_error("Failed to install metrics recorder", e))?;

    let store = connect_store(&cli).await?;
    let config = AnalyticsConfig::from_env();
    log::debug!("Engine configuration: {:?}", config);

    let state = web::Data::new(AppState::new(cli.role, store, config, prometheus));

    if cli.role.serves_timeseries() {
        state
            .series
            .initialize()
            .await
            .map_err(|e| startup_error("Failed to create time series", e))?;
    }

    let worker = state.spawn_worker();
    let result = run_server(state, cli.port).await;
    worker.stop();

    log::info!("Token analytics server stopped");
    result
}
