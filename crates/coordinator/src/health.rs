use crate::supervisor::Supervisor;
use anyhow::Context;
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use std::sync::Arc;

/// Serve the health endpoint on `port` until the task is dropped. Every
/// path answers 200 with the live worker count.
pub async fn serve(port: u16, supervisor: Arc<Supervisor>) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/", get(handle_count))
        .fallback(handle_count)
        .with_state(supervisor);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .context("failed to bind health port")?;

    tracing::info!(port, "health endpoint listening");

    axum::serve(listener, app).await.context("health server failed")
}

async fn handle_count(State(supervisor): State<Arc<Supervisor>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "workers": supervisor.count() }))
}
