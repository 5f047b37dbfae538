//! Gatehouse: a SAML service provider gateway for legacy applications.
//!
//! The gateway authenticates browsers against external identity providers
//! and hands the result to legacy backends in two ways: a row in the shared
//! `authentication_sessions` table and a cookie on the application's domain.

use std::sync::Arc;

use axum::{Router, routing::get};
use tokio_util::task::TaskTracker;
use tower_cookies::CookieManagerLayer;
use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};

pub mod auth;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod observability;
pub mod routes;

#[cfg(test)]
mod test_support;
#[cfg(test)]
mod tests;

use crate::{
    auth::{SamaelVerifier, SqlSessionStore},
    config::GatewayConfig,
    dispatch::{GatewayDispatcher, GatewayUnitFactory, UnitServices},
    error::GatewayError,
};

#[derive(Clone)]
pub struct AppState {
    /// Settings snapshot handed to every execution unit.
    pub config: Arc<GatewayConfig>,
    pub dispatcher: Arc<GatewayDispatcher>,
}

impl AppState {
    /// `tracker` is the one the server waits on at shutdown.
    pub fn new(config: Arc<GatewayConfig>, services: UnitServices, tracker: TaskTracker) -> Self {
        let dispatcher = GatewayDispatcher::new(
            GatewayUnitFactory::new(services),
            tracker,
            config.server.dispatch_timeout(),
        );
        Self {
            config,
            dispatcher: Arc::new(dispatcher),
        }
    }

    /// Wire the production collaborators: the SQL session store and the
    /// samael signature verifier.
    pub fn from_config(config: GatewayConfig, tracker: TaskTracker) -> Result<Self, GatewayError> {
        let services = UnitServices {
            session_store: Arc::new(SqlSessionStore::new(&config.database)?),
            verifier: Arc::new(SamaelVerifier::new(config.saml.clock_skew())),
        };
        Ok(Self::new(Arc::new(config), services, tracker))
    }
}

/// Build the router: health and metrics at the root, each service nested
/// under its `base_path`.
pub fn build_app(config: &GatewayConfig, state: AppState) -> Result<Router, GatewayError> {
    let mut app = Router::new()
        .route("/health", get(routes::health::health_check))
        .route("/health/live", get(routes::health::liveness));

    if config.observability.metrics.enabled {
        app = app.route("/metrics", get(routes::health::metrics));
    }

    for (name, service) in &config.services {
        let service_routes = routes::service_routes(name)?;
        let base_path = service.base_path.trim_end_matches('/');
        app = if base_path.is_empty() {
            app.merge(service_routes)
        } else {
            app.nest(base_path, service_routes)
        };
        tracing::debug!(service = %name, base_path = %service.base_path, "SAML service mounted");
    }

    Ok(app
        .layer(CookieManagerLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(RequestBodyLimitLayer::new(config.server.body_limit_bytes))
        .with_state(state))
}
