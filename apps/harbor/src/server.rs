use std::future::Future;
use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use harbor_proto::CloseReason;
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::ServerConfig;
use crate::websocket::{websocket_handler, AppState};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/boats", get(boats_handler))
        .route("/metrics", get(metrics_handler))
        .route("/ws", get(websocket_handler))
        .route("/boat", get(websocket_handler))
        .route("/browser", get(websocket_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Serve on an already-bound listener until `shutdown` resolves, then ask
/// every remaining connection to close.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let broker = state.broker.clone();
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown.await;
        info!("shutdown signal received; closing connections");
        broker.close_all(CloseReason::Shutdown);
    })
    .await
    .context("server shutdown with error")
}

pub async fn run(config: ServerConfig, metrics: Option<PrometheusHandle>) -> Result<()> {
    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    let grace = config.shutdown_grace;
    info!(
        listen_addr = %config.listen_addr,
        device = ?config.device,
        idle_timeout_secs = config.idle_timeout.as_secs(),
        "harbor listening"
    );

    let state = AppState::new(config, metrics);
    serve(listener, state, shutdown_signal()).await?;

    info!(
        grace_seconds = grace.as_secs(),
        "sleeping for graceful period"
    );
    tokio::time::sleep(grace).await;
    info!("graceful shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "boats": state.broker.registry().len(),
        "viewers": state.broker.viewer_count(),
        "device": state.device.name(),
    }))
}

async fn boats_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({ "boats": state.broker.list_boats() }))
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    match &state.metrics {
        Some(handle) => (StatusCode::OK, handle.render()).into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}
