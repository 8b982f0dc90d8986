//! HTTP surface.
//!
//! `POST /` takes an encoded build unit and answers with a step response.
//! Decode failures are client errors (400); everything that fails after
//! decoding is a regular step outcome (200 with `success: false`).

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use distbuild_core::config::WorkerConfig;
use distbuild_core::response::StepResponse;
use distbuild_core::unit::BuildUnit;
use distbuild_runtime::StepOrchestrator;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
struct AppState {
    orchestrator: Arc<StepOrchestrator>,
    timeout: Option<Duration>,
}

/// Build the worker router.
pub fn router(orchestrator: Arc<StepOrchestrator>, config: &WorkerConfig) -> Router {
    let state = AppState {
        orchestrator,
        timeout: config.request_timeout(),
    };
    let body_limit = usize::try_from(config.max_body_bytes).unwrap_or(usize::MAX);

    Router::new()
        .route("/", post(run_step))
        .route("/healthz", get(healthz))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

/// Bind `config.listen` and serve until Ctrl-C.
pub async fn serve(orchestrator: Arc<StepOrchestrator>, config: &WorkerConfig) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(&config.listen)
        .await
        .map_err(|e| anyhow!("Failed to bind to {}: {}", config.listen, e))?;
    tracing::info!(addr = %listener.local_addr()?, "Worker listening");

    axum::serve(listener, router(orchestrator, config))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| anyhow!("Server error: {}", e))?;

    tracing::info!("Worker stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}

async fn healthz() -> &'static str {
    "ok"
}

async fn run_step(State(state): State<AppState>, body: Bytes) -> Response {
    let unit = match BuildUnit::decode(&body) {
        Ok(unit) => unit,
        Err(e) => {
            tracing::warn!(error = %e, size = body.len(), "Rejected build unit");
            return (StatusCode::BAD_REQUEST, Json(StepResponse::failed(&e))).into_response();
        }
    };

    let cancel = CancellationToken::new();
    let deadline = state.timeout.map(|timeout| {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            cancel.cancel();
        })
    });

    let report = state.orchestrator.run(unit, &cancel).await;

    if let Some(timer) = deadline {
        timer.abort();
    }

    (StatusCode::OK, Json(report.to_response())).into_response()
}
