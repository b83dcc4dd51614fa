//! Admin listener endpoints
//!
//! `/livez`, `/readyz`, and `POST /shutdown` live on the admin listener
//! only: no tenant scope, no rate limit, no session. Readiness means the
//! lifecycle reached READY (which implies the barrier unsealed) and the
//! database answers a probe.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, routing::post, Json, Router};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::repository::Repository;
use crate::server::{Lifecycle, LifecycleState};

/// State for the admin router.
#[derive(Clone)]
pub struct AdminState {
    pub lifecycle: Arc<Lifecycle>,
    pub repo: Arc<Repository>,
}

/// Liveness response body
#[derive(Debug, Serialize, Deserialize)]
pub struct LivenessResponse {
    /// Process status
    pub status: String,
    /// Lifecycle state
    pub state: String,
    /// Crate version
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Readiness response body with dependency status
#[derive(Debug, Serialize, Deserialize)]
pub struct ReadinessResponse {
    /// Overall readiness
    pub ready: bool,
    /// Lifecycle state
    pub state: String,
    /// Dependency statuses
    pub dependencies: HashMap<String, DependencyStatus>,
}

/// Individual dependency status
#[derive(Debug, Serialize, Deserialize)]
pub struct DependencyStatus {
    /// Dependency is healthy
    pub healthy: bool,
    /// Optional message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Liveness probe: 200 while the process has not STOPPED.
pub async fn livez(State(state): State<AdminState>) -> impl IntoResponse {
    let lifecycle_state = state.lifecycle.state();
    let status = if lifecycle_state == LifecycleState::Stopped {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    let body = LivenessResponse {
        status: if status == StatusCode::OK {
            "alive".to_string()
        } else {
            "stopped".to_string()
        },
        state: lifecycle_state.to_string(),
        version: Some(env!("CARGO_PKG_VERSION").to_string()),
    };
    (status, Json(body))
}

/// Readiness probe: 200 iff the lifecycle is READY and the database is
/// reachable; 503 otherwise (including while unseal is still in progress).
pub async fn readyz(State(state): State<AdminState>) -> impl IntoResponse {
    let lifecycle_state = state.lifecycle.state();
    let mut dependencies = HashMap::new();
    let mut ready = lifecycle_state == LifecycleState::Ready;

    dependencies.insert(
        "barrier".to_string(),
        DependencyStatus {
            healthy: ready,
            message: if ready {
                Some("unsealed".to_string())
            } else {
                Some(format!("lifecycle is {lifecycle_state}"))
            },
        },
    );

    match state.repo.ping().await {
        Ok(()) => {
            dependencies.insert(
                "database".to_string(),
                DependencyStatus {
                    healthy: true,
                    message: Some("connected".to_string()),
                },
            );
        }
        Err(e) => {
            tracing::error!("database readiness probe failed: {e}");
            ready = false;
            dependencies.insert(
                "database".to_string(),
                DependencyStatus {
                    healthy: false,
                    message: Some(format!("probe failed: {e}")),
                },
            );
        }
    }

    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = ReadinessResponse {
        ready,
        state: lifecycle_state.to_string(),
        dependencies,
    };
    (status, Json(body))
}

/// Shutdown trigger: flips the lifecycle into DRAINING and returns 202. The
/// serve loop notices and drives the drain.
pub async fn shutdown(State(state): State<AdminState>) -> impl IntoResponse {
    state.lifecycle.begin_drain();
    (StatusCode::ACCEPTED, Json(serde_json::json!({ "status": "draining" })))
}

/// Assemble the admin router (state attached by the caller).
pub fn admin_router() -> Router<AdminState> {
    Router::new()
        .route("/livez", get(livez))
        .route("/readyz", get(readyz))
        .route("/shutdown", post(shutdown))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn admin_state(ready: bool) -> AdminState {
        let repo = Arc::new(Repository::connect_in_memory().await.unwrap());
        let lifecycle = Arc::new(Lifecycle::new());
        if ready {
            lifecycle.advance(LifecycleState::Starting);
            lifecycle.advance(LifecycleState::Ready);
        }
        AdminState { lifecycle, repo }
    }

    fn router(state: AdminState) -> Router {
        admin_router().with_state(state)
    }

    #[tokio::test]
    async fn livez_is_ok_before_ready() {
        let app = router(admin_state(false).await);
        let response = app
            .oneshot(Request::get("/livez").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn readyz_is_503_until_ready() {
        let app = router(admin_state(false).await);
        let response = app
            .oneshot(Request::get("/readyz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn readyz_is_200_when_ready_and_db_reachable() {
        let app = router(admin_state(true).await);
        let response = app
            .oneshot(Request::get("/readyz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn shutdown_returns_202_and_drains() {
        let state = admin_state(true).await;
        let app = router(state.clone());
        let response = app
            .oneshot(Request::post("/shutdown").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(state.lifecycle.state(), LifecycleState::Draining);
    }
}
