//! Health check and metrics endpoints.

use axum::{Json, extract::State, response::IntoResponse};
use http::StatusCode;
use serde::Serialize;

use crate::AppState;
#[cfg(feature = "prometheus")]
use crate::observability::metrics::get_prometheus_handle;

/// Health status response.
#[derive(Debug, Serialize)]
pub struct HealthStatus {
    /// Always "healthy" while the process serves requests
    pub status: String,
    /// Service version
    pub version: String,
    /// Names of the mounted SAML services
    pub services: Vec<String>,
    pub units: UnitStatus,
}

/// Execution unit counters.
#[derive(Debug, Serialize)]
pub struct UnitStatus {
    /// Units created since startup
    pub spawned: u64,
    /// Units currently running
    pub running: usize,
}

/// Liveness check with unit counters.
///
/// The session store is not probed: it is only contacted by `/acs`, on a
/// connection that lives for one statement.
#[tracing::instrument(name = "health.check", skip(state))]
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let health = HealthStatus {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        services: state.config.services.keys().cloned().collect(),
        units: UnitStatus {
            spawned: state.dispatcher.units_spawned(),
            running: state.dispatcher.tracker().len(),
        },
    };

    (StatusCode::OK, Json(health))
}

/// Kubernetes liveness probe.
#[tracing::instrument(name = "health.liveness")]
pub async fn liveness() -> impl IntoResponse {
    StatusCode::OK
}

/// Prometheus metrics endpoint.
///
/// Returns metrics in Prometheus text format.
#[tracing::instrument(name = "health.metrics")]
pub async fn metrics() -> impl IntoResponse {
    #[cfg(feature = "prometheus")]
    {
        return match get_prometheus_handle() {
            Some(handle) => {
                let metrics: String = handle.render();
                (
                    StatusCode::OK,
                    [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                    metrics,
                )
            }
            None => (
                StatusCode::SERVICE_UNAVAILABLE,
                [("content-type", "text/plain")],
                "Metrics not initialized".to_string(),
            ),
        };
    }
    #[cfg(not(feature = "prometheus"))]
    (
        StatusCode::NOT_FOUND,
        [("content-type", "text/plain")],
        "Prometheus metrics not enabled".to_string(),
    )
}

#[cfg(all(test, feature = "database-sqlite"))]
mod tests {
    use axum::{Router, body::Body};
    use http::Request;
    use serde_json::Value;
    use tower::ServiceExt;

    use super::*;
    use crate::test_support::{StubVerifier, TestEnv};

    async fn test_app() -> (TestEnv, Router) {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();

        let env = TestEnv::new().await;
        let state = AppState::new(
            env.config.clone(),
            env.services(StubVerifier::rejecting("unused")),
            tokio_util::task::TaskTracker::new(),
        );
        let app = crate::build_app(&env.config, state).unwrap();
        (env, app)
    }

    async fn get(app: &Router, uri: &str) -> (StatusCode, String) {
        let request = Request::builder()
            .method("GET")
            .uri(uri)
            .body(Body::empty())
            .unwrap();

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8_lossy(&body).to_string())
    }

    #[tokio::test]
    async fn test_health_check() {
        let (_env, app) = test_app().await;

        let (status, body) = get(&app, "/health").await;
        let json: Value = serde_json::from_str(&body).unwrap();

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "healthy");
        assert!(json["version"].as_str().unwrap().contains('.'));
        assert_eq!(json["services"], serde_json::json!(["sso"]));
        assert_eq!(json["units"]["spawned"], 0);
    }

    #[tokio::test]
    async fn test_health_counts_units() {
        let (_env, app) = test_app().await;

        get(&app, "/sso/metadata").await;
        let (_, body) = get(&app, "/health").await;
        let json: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["units"]["spawned"], 1);
    }

    #[tokio::test]
    async fn test_liveness_always_ok() {
        let (_env, app) = test_app().await;
        let (status, _) = get(&app, "/health/live").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_metrics_endpoint_mounted() {
        let (_env, app) = test_app().await;
        let (status, _) = get(&app, "/metrics").await;
        // Depends on whether another test installed the global recorder.
        assert!(
            status == StatusCode::OK
                || status == StatusCode::SERVICE_UNAVAILABLE
                || status == StatusCode::NOT_FOUND,
            "{status}"
        );
    }
}
