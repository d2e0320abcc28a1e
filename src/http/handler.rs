//! axum router for the symbol proxy.
//!
//! Routes:
//! - `GET /healthz`  - Health check
//! - `GET /metrics`  - Prometheus metrics
//! - `GET /{*path}`  - Symbol lookup through the cache store and origin

use std::sync::Arc;

use axum::{
    Router,
    extract::State,
    http::{Method, StatusCode, Uri, header},
    response::{IntoResponse, Response},
    routing::get,
};
use tracing::{debug, error, info, instrument};

use super::resolver::{Outcome, Resolution};
use crate::AppState;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the axum [`Router`] with all HTTP routes and shared state.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(handle_health))
        .route("/metrics", get(handle_metrics))
        // Every other path is a symbol path.
        .fallback(handle_symbol)
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET /{*path}`
///
/// Any other method, HEAD included, is refused before resolution so it can
/// never trigger an origin fetch or a cache write.
#[instrument(skip(state, method, uri), fields(%method, path = %uri.path()))]
async fn handle_symbol(State(state): State<Arc<AppState>>, method: Method, uri: Uri) -> Response {
    if method != Method::GET {
        debug!("method not allowed");
        return (StatusCode::METHOD_NOT_ALLOWED, [(header::ALLOW, "GET")]).into_response();
    }

    let retry_limit = state.config.origin.effective_retry_count();
    let Resolution { outcome, response } = state.resolver.resolve(uri.path(), retry_limit).await;

    log_outcome(state.config.verbose, outcome, response.status());
    response
}

fn log_outcome(verbose: bool, outcome: Outcome, status: StatusCode) {
    match (outcome.is_served(), verbose) {
        (true, true) => info!(?outcome, %status, "symbol served"),
        (true, false) => debug!(?outcome, %status, "symbol served"),
        (false, true) => info!(?outcome, %status, "symbol unavailable"),
        (false, false) => debug!(?outcome, %status, "symbol unavailable"),
    }
}

/// `GET /healthz`
async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health_state = crate::health::HealthState {
        origin: Arc::clone(state.resolver.origin()),
        store: state.resolver.store().cloned(),
    };
    crate::health::health_handler(health_state).await
}

/// `GET /metrics`
///
/// Returns Prometheus metrics collected by the proxy.
async fn handle_metrics(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    let buf = state
        .metrics
        .encode()
        .map_err(|e| anyhow::anyhow!("metrics encoding failed: {e}"))?;

    Ok((
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        buf,
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Application-level error type that maps cleanly to HTTP responses.
#[derive(Debug)]
pub enum AppError {
    /// An unexpected internal error.
    Internal(anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Internal(err) => {
                error!(error = %err, "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Internal server error: {err:#}"),
                )
                    .into_response()
            }
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err)
    }
}
