use axum::{
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};

use crate::observability::metrics;

/// Errors produced anywhere between the router and the session store.
///
/// Every failure inside an execution unit crosses the isolation boundary as
/// one of these values. Messages carry configuration names and file paths,
/// never key material.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    /// Malformed or missing service provider / identity provider descriptor.
    #[error("Protocol configuration error: {0}")]
    ProtocolConfig(String),

    /// The IdP response failed signature, schema, policy or time checks.
    #[error("Invalid assertion: {0}")]
    InvalidAssertion(String),

    /// The assertion carried no SessionIndex although one was required.
    #[error("Assertion is missing a session index")]
    MissingSessionIndex,

    /// Key material could not be read or parsed.
    #[error("{0}")]
    CredentialUnreadable(String),

    /// No connection to the session store could be opened.
    #[error("Session store unavailable: {0}")]
    StoreUnavailable(String),

    /// The upsert statement failed.
    #[error("Session store write failed: {0}")]
    StoreWriteFailed(String),

    /// Reading a row back failed.
    #[error("Session store read failed: {0}")]
    StoreReadFailed(String),

    /// No handler exists for the requested endpoint name.
    #[error("Unknown endpoint: {0}")]
    UnknownEndpoint(String),

    /// A unit or store operation exceeded its deadline.
    #[error("Timed out after {0} ms: {1}")]
    Timeout(u128, String),

    /// The execution unit crashed before replying.
    #[error("Execution unit fault: {0}")]
    UnitFault(String),

    /// Required request parameters were missing or malformed.
    #[error("Bad request: {0}")]
    BadRequest(String),
}

impl GatewayError {
    /// Stable machine-readable code, used for logs and metrics labels.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::ProtocolConfig(_) => "protocol_config",
            GatewayError::InvalidAssertion(_) => "invalid_assertion",
            GatewayError::MissingSessionIndex => "missing_session_index",
            GatewayError::CredentialUnreadable(_) => "credential_unreadable",
            GatewayError::StoreUnavailable(_) => "store_unavailable",
            GatewayError::StoreWriteFailed(_) => "store_write_failed",
            GatewayError::StoreReadFailed(_) => "store_read_failed",
            GatewayError::UnknownEndpoint(_) => "unknown_endpoint",
            GatewayError::Timeout(..) => "timeout",
            GatewayError::UnitFault(_) => "unit_fault",
            GatewayError::BadRequest(_) => "bad_request",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::Timeout(..) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message shown to clients.
    ///
    /// In verbose mode this is the real error. Otherwise it is a fixed,
    /// non-identifying sentence per error kind so that file paths and
    /// upstream details do not leak into responses.
    pub fn public_message(&self, verbose: bool) -> String {
        if verbose {
            return self.to_string();
        }
        match self {
            GatewayError::ProtocolConfig(_)
            | GatewayError::CredentialUnreadable(_)
            | GatewayError::UnknownEndpoint(_) => "Service configuration error".to_string(),
            GatewayError::InvalidAssertion(_) | GatewayError::MissingSessionIndex => {
                "Authentication failed".to_string()
            }
            GatewayError::StoreUnavailable(_) | GatewayError::StoreWriteFailed(_) => {
                "Unable to record session".to_string()
            }
            GatewayError::StoreReadFailed(_) => "Unable to read session".to_string(),
            GatewayError::Timeout(..) => "Request timed out".to_string(),
            GatewayError::UnitFault(_) => "Internal error".to_string(),
            GatewayError::BadRequest(_) => "Invalid request".to_string(),
        }
    }

    /// Render as the plain-text error response of a service.
    pub fn into_response_for(self, title: &str, verbose: bool) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(code = self.code(), error = %self, "Request failed");
        } else {
            tracing::warn!(code = self.code(), error = %self, "Request rejected");
        }
        metrics::record_gateway_error(self.code());

        let body = format!("{}: {}", title, self.public_message(verbose));
        (
            status,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            body,
        )
            .into_response()
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        self.into_response_for("Gatehouse", false)
    }
}
