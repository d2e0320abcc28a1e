use std::sync::Arc;

use axum::Json;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::Serialize;

use crate::origin::OriginClient;
use crate::storage::CacheStore;

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub checks: HealthChecks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Serialize)]
pub struct HealthChecks {
    pub origin: CheckResult,
    /// Absent when no cache store is configured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store: Option<CheckResult>,
}

#[derive(Debug, Serialize)]
pub struct CheckResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CheckResult {
    fn from_probe(probe: anyhow::Result<()>, target: String) -> Self {
        match probe {
            Ok(()) => Self {
                ok: true,
                detail: Some(target),
            },
            Err(e) => Self {
                ok: false,
                detail: Some(format!("{target}: {e:#}")),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Shared state expected by the handler
// ---------------------------------------------------------------------------

/// The collaborators the health report probes.
#[derive(Clone)]
pub struct HealthState {
    pub origin: Arc<dyn OriginClient>,
    pub store: Option<Arc<dyn CacheStore>>,
}

// ---------------------------------------------------------------------------
// Aggregate status
// ---------------------------------------------------------------------------

fn aggregate_status(checks: &HealthChecks) -> HealthStatus {
    // Without the origin nothing uncached can be served; without the store
    // every request still resolves through the origin.
    if !checks.origin.ok {
        HealthStatus::Unhealthy
    } else if checks.store.as_ref().is_some_and(|s| !s.ok) {
        HealthStatus::Degraded
    } else {
        HealthStatus::Ok
    }
}

pub async fn run_checks(state: &HealthState) -> HealthResponse {
    let origin_probe = state.origin.check();
    let store_probe = async {
        match &state.store {
            Some(store) => Some(CheckResult::from_probe(
                store.check().await,
                store.describe(),
            )),
            None => None,
        }
    };
    let (origin, store) = tokio::join!(origin_probe, store_probe);

    let checks = HealthChecks {
        origin: CheckResult::from_probe(origin, state.origin.base_uri().to_string()),
        store,
    };
    HealthResponse {
        status: aggregate_status(&checks),
        checks,
    }
}

// ---------------------------------------------------------------------------
// Axum handler
// ---------------------------------------------------------------------------

/// `GET /healthz` handler.  Returns 200 on Ok/Degraded, 503 on Unhealthy.
pub async fn health_handler(state: HealthState) -> impl IntoResponse {
    let body = run_checks(&state).await;

    let http_status = match body.status {
        HealthStatus::Ok | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (http_status, Json(body))
}
