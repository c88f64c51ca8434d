use std::io;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};

use crate::handlers;
use crate::state::{AppState, ServiceRole};

/// Registers the route groups served by `role`. Health and metrics are
/// always mounted.
pub fn routes(role: ServiceRole) -> impl Fn(&mut web::ServiceConfig) + Clone {
    move |cfg: &mut web::ServiceConfig| {
        cfg.route("/health", web::get().to(handlers::health::handler))
            .route("/metrics", web::get().to(handlers::metrics::handler));

        if role.serves_capture() {
            cfg.route("/capture", web::post().to(handlers::capture::handler))
                .route("/classify", web::post().to(handlers::classify::handler));
        }
        if role.serves_analytics() {
            cfg.route("/analytics", web::get().to(handlers::analytics::handler));
        }
        if role.serves_timeseries() {
            cfg.route("/query", web::post().to(handlers::timeseries::query))
                .route(
                    "/multi-query",
                    web::post().to(handlers::timeseries::multi_query),
                )
                .route("/latest", web::get().to(handlers::timeseries::latest))
                .route("/points", web::post().to(handlers::timeseries::add_point));
        }
    }
}

/// Every route group.
pub fn app_config(cfg: &mut web::ServiceConfig) {
    routes(ServiceRole::All)(cfg);
}

pub async fn run_server(state: web::Data<AppState>, port: u16) -> io::Result<()> {
    let role = state.role;
    log::info!(
        "Serving role '{}' on 0.0.0.0:{}",
        role.as_str(),
        port
    );

    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .wrap(Cors::permissive())
            .configure(routes(role))
    })
    .bind(format!("0.0.0.0:{}", port))?
    .run()
    .await
}
