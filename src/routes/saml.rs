//! SAML service endpoints.
//!
//! Every configured service gets the same four routes, nested under its
//! `base_path`:
//! - `GET /cookie` - issues a synthetic test cookie (not persisted)
//! - `GET /metadata` - SP metadata for IdP configuration
//! - `GET /sso-redirect` - sends the browser to the IdP with an AuthnRequest
//! - `POST /acs` - Assertion Consumer Service (HTTP-POST binding)
//!
//! The handlers only translate between HTTP and the dispatcher; all protocol
//! work happens inside an execution unit.

use std::sync::Arc;

use axum::{
    Router,
    extract::{RawQuery, State},
    response::{IntoResponse, Redirect, Response},
    routing::{MethodFilter, on},
};
use bytes::Bytes;
use http::{HeaderMap, StatusCode, header};
use tower_cookies::Cookies;
use uuid::Uuid;

use crate::{
    AppState,
    dispatch::{Endpoint, GatewayDispatcher, Reply, RequestDescriptor},
    error::GatewayError,
};

struct ServiceRoute {
    path: &'static str,
    method: MethodFilter,
    endpoint: &'static str,
}

const SERVICE_ROUTES: [ServiceRoute; 4] = [
    ServiceRoute {
        path: "/cookie",
        method: MethodFilter::GET,
        endpoint: "cookie",
    },
    ServiceRoute {
        path: "/metadata",
        method: MethodFilter::GET,
        endpoint: "metadata",
    },
    ServiceRoute {
        path: "/sso-redirect",
        method: MethodFilter::GET,
        endpoint: "sso-redirect",
    },
    ServiceRoute {
        path: "/acs",
        method: MethodFilter::POST,
        endpoint: "acs",
    },
];

/// Build the routes of one service. Endpoint names are resolved here, so a
/// route bound to an unknown endpoint fails router construction.
pub fn service_routes(service: &str) -> Result<Router<AppState>, GatewayError> {
    let service: Arc<str> = Arc::from(service);
    let mut router = Router::new();

    for route in SERVICE_ROUTES {
        let endpoint = GatewayDispatcher::resolve(route.endpoint)?;
        let service = service.clone();
        let handler = move |State(state): State<AppState>,
                            headers: HeaderMap,
                            RawQuery(query): RawQuery,
                            cookies: Cookies,
                            body: Bytes| {
            let service = service.clone();
            async move { handle(state, service, endpoint, headers, query, cookies, body).await }
        };
        router = router.route(route.path, on(route.method, handler));
    }

    Ok(router)
}

#[tracing::instrument(
    name = "saml.endpoint",
    skip_all,
    fields(service = %service, endpoint = %endpoint)
)]
async fn handle(
    state: AppState,
    service: Arc<str>,
    endpoint: Endpoint,
    headers: HeaderMap,
    query: Option<String>,
    cookies: Cookies,
    body: Bytes,
) -> Response {
    let settings = state.config.clone();
    let debug = settings.server.debug;
    let title = settings
        .service(&service)
        .map(|s| s.title.clone())
        .unwrap_or_else(|_| settings.server.title.clone());

    let request = RequestDescriptor {
        request_id: Uuid::new_v4(),
        settings,
        service: service.to_string(),
        debug,
        headers,
        body,
        query,
    };

    state
        .dispatcher
        .dispatch_method(endpoint, request)
        .await
        .and_then(|reply| render(reply, &title, &cookies))
        .unwrap_or_else(|e| e.into_response_for(&title, debug))
}

fn render(reply: Reply, title: &str, cookies: &Cookies) -> Result<Response, GatewayError> {
    match reply {
        Reply::Cookie {
            record,
            cookie_name,
        } => {
            cookies.add(record.to_cookie(cookie_name)?);
            Ok((
                StatusCode::OK,
                [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
                format!("{title}: test cookie issued"),
            )
                .into_response())
        }
        Reply::Metadata(xml) => Ok((
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/xml")],
            xml,
        )
            .into_response()),
        Reply::Redirect(url) => Ok(Redirect::to(&url).into_response()),
        Reply::Login {
            record,
            cookie_name,
            redirect_to,
        } => {
            cookies.add(record.to_cookie(cookie_name)?);
            Ok(Redirect::to(&redirect_to).into_response())
        }
    }
}
