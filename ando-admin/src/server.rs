use crate::handlers;
use crate::middleware::api_key_auth;
use crate::search::LogSearch;
use ando_core::config::{AdminConfig, LogSearchConfig};
use ando_observability::metrics::SearchMetrics;
use axum::{
    Router as AxumRouter,
    body::Body,
    extract::State,
    http::Request,
    middleware,
    routing::get,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Shared state for the admin API.
pub struct AdminState {
    pub search: LogSearch,
    pub config: LogSearchConfig,
    pub metrics: Arc<SearchMetrics>,
}

/// Build the axum router with all admin routes.
pub fn build_admin_router(state: Arc<AdminState>) -> AxumRouter {
    let stats = AxumRouter::new()
        .route("/logs.json", get(handlers::logs::logs_json))
        .route("/logs.csv", get(handlers::logs::logs_csv))
        .route_layer(middleware::from_fn_with_state(state.clone(), api_key_auth));

    let mut app = AxumRouter::new()
        .nest("/admin/stats", stats)
        .route("/health", get(handlers::health::health_check));

    let prometheus = &state.config.observability.prometheus;
    if prometheus.enabled {
        app = app.route(&prometheus.path, get(metrics_handler));
    }

    // Spans carry the path only: query strings hold filter values.
    app.layer(TraceLayer::new_for_http().make_span_with(|req: &Request<Body>| {
        tracing::info_span!("admin", method = %req.method(), path = %req.uri().path())
    }))
    .with_state(state)
}

/// Start the admin API server.
pub async fn start_admin(config: AdminConfig, state: Arc<AdminState>) -> anyhow::Result<()> {
    if !config.enabled {
        info!("Admin API disabled");
        return Ok(());
    }

    let app = build_admin_router(state);
    let listener = tokio::net::TcpListener::bind(&config.addr).await?;
    info!(addr = %config.addr, "Admin API listening");
    axum::serve(listener, app).await?;
    Ok(())
}

/// Prometheus metrics endpoint handler.
async fn metrics_handler(State(state): State<Arc<AdminState>>) -> String {
    state.metrics.render()
}
