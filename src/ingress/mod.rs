//! Ingress
//!
//! The HTTP surface in front of the cognitive loop: message intake,
//! conversation queries, approvals, observability, and admin triggers.
//! Shares nothing with the loop beyond the store handle and the signal
//! channel.

pub mod middleware;
pub mod routes;

pub use middleware::RateLimitState;
pub use routes::AppState;

use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    middleware as axum_middleware,
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Request bodies above this are refused outright.
const BODY_LIMIT_BYTES: usize = 10 * 1024 * 1024;

/// Assemble the full route table with its middleware stack.
pub fn router(state: AppState) -> Router {
    let rate = Arc::clone(&state.rate);
    Router::new()
        .route("/message", post(routes::post_message))
        .route("/conversations", get(routes::get_conversations))
        .route("/conversations/:id", get(routes::get_conversation))
        .route("/conversations/:id/approvals", get(routes::get_approvals))
        .route("/conversations/:id/approve", post(routes::post_approve))
        .route("/conversations/:id/reject", post(routes::post_reject))
        .route("/health", get(routes::get_health))
        .route("/ready", get(routes::get_ready))
        .route("/live", get(routes::get_live))
        .route("/energy", get(routes::get_energy))
        .route("/stats", get(routes::get_stats))
        .route("/admin/trigger-reflection", post(routes::post_trigger_reflection))
        .route(
            "/admin/process-conversation/:id",
            post(routes::post_process_conversation),
        )
        .layer(axum_middleware::from_fn_with_state(rate, middleware::rate_limit))
        .layer(RequestBodyLimitLayer::new(BODY_LIMIT_BYTES))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve until `shutdown` resolves.
pub async fn serve<F>(state: AppState, port: u16, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = format!("0.0.0.0:{port}");
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind ingress to {addr}"))?;
    info!("ingress listening on {addr}");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("ingress server failed")?;
    Ok(())
}
