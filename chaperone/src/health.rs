//! Health HTTP surface: readiness/drain endpoints and a debug backends proxy.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tokio::sync::RwLock;

use crate::admin::commands;
use crate::admin::AdminHandle;

#[derive(Debug, Default)]
struct Inner {
    ready: bool,
    draining: bool,
}

/// Process-wide ready/draining flags, guarded by a read-write lock since
/// reads (health checks) vastly outnumber writes (ready/drain transitions).
#[derive(Clone)]
pub struct HealthState(Arc<RwLock<Inner>>);

impl HealthState {
    pub fn new() -> Self {
        Self(Arc::new(RwLock::new(Inner::default())))
    }

    pub async fn set_ready(&self) {
        self.0.write().await.ready = true;
    }

    pub async fn set_draining(&self) {
        self.0.write().await.draining = true;
    }

    pub async fn is_draining(&self) -> bool {
        self.0.read().await.draining
    }
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
struct AppState {
    health: HealthState,
    admin: AdminHandle,
}

pub fn router(health: HealthState, admin: AdminHandle) -> Router {
    let state = AppState { health, admin };
    Router::new()
        .route("/health", get(health_handler))
        .route("/drain", post(drain_handler))
        .route("/debug/backends", get(debug_backends_handler))
        .with_state(state)
}

async fn health_handler(State(state): State<AppState>) -> Response {
    let inner = state.health.0.read().await;
    if inner.draining {
        return (StatusCode::SERVICE_UNAVAILABLE, "draining").into_response();
    }
    if !inner.ready {
        return (StatusCode::SERVICE_UNAVAILABLE, "not ready").into_response();
    }
    (StatusCode::OK, "ok").into_response()
}

async fn drain_handler(State(state): State<AppState>) -> Response {
    state.health.set_draining().await;
    (StatusCode::OK, "draining").into_response()
}

#[derive(Debug, Deserialize)]
struct DebugBackendsParams {
    #[serde(default)]
    format: Option<String>,
    #[serde(default)]
    detailed: bool,
}

async fn debug_backends_handler(
    State(state): State<AppState>,
    Query(params): Query<DebugBackendsParams>,
) -> Response {
    match state.admin.exec(commands::backend_list()).await {
        Ok(resp) if resp.is_ok() => {
            if params.format.as_deref() == Some("json") {
                Json(serde_json::json!({
                    "detailed": params.detailed,
                    "payload": resp.payload,
                }))
                .into_response()
            } else {
                (StatusCode::OK, resp.payload).into_response()
            }
        }
        Ok(resp) => (StatusCode::BAD_GATEWAY, resp.payload).into_response(),
        Err(err) => (StatusCode::BAD_GATEWAY, err.to_string()).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn health_state_defaults_to_not_ready() {
        let state = HealthState::new();
        let inner = state.0.read().await;
        assert!(!inner.ready);
        assert!(!inner.draining);
    }

    #[tokio::test]
    async fn set_ready_then_draining_reports_draining() {
        let state = HealthState::new();
        state.set_ready().await;
        state.set_draining().await;
        assert!(state.is_draining().await);
    }
}
