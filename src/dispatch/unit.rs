//! The SAML execution unit: one instance per HTTP request.

use std::{fmt, str::FromStr, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use http::HeaderMap;
use uuid::Uuid;

use super::bridge::{ExecutionUnit, UnitFactory};
use crate::{
    auth::{
        AssertionVerifier, AuthenticationRecord, CookiePolicy, CredentialLoader, RelaySigner,
        RelayState, ServiceProviderDescriptor, SharedSessionStore, ValidationOptions, saml,
    },
    config::{GatewayConfig, ServiceConfig},
    error::GatewayError,
};

/// Cookie set by the test-only `/cookie` endpoint.
pub const TEST_COOKIE_NAME: &str = "gatehouse_test";
/// Cookie set after a successful ACS post.
pub const SESSION_COOKIE_NAME: &str = "gatehouse_session";

/// Subject and session index of the synthetic `/cookie` record.
const TEST_SUBJECT: &str = "test-user";
const TEST_SESSION_INDEX: &str = "test-session";

/// Operations a [`GatewayUnit`] can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Cookie,
    Metadata,
    SsoRedirect,
    Acs,
}

impl Endpoint {
    pub const ALL: [Endpoint; 4] = [
        Endpoint::Cookie,
        Endpoint::Metadata,
        Endpoint::SsoRedirect,
        Endpoint::Acs,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Endpoint::Cookie => "cookie",
            Endpoint::Metadata => "metadata",
            Endpoint::SsoRedirect => "sso-redirect",
            Endpoint::Acs => "acs",
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Endpoint {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Endpoint::ALL
            .into_iter()
            .find(|endpoint| endpoint.as_str() == s)
            .ok_or_else(|| GatewayError::UnknownEndpoint(s.to_string()))
    }
}

/// Everything a unit gets to see of the inbound request.
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    pub request_id: Uuid,
    /// Immutable snapshot of the settings taken when the request arrived.
    pub settings: Arc<GatewayConfig>,
    /// Name of the service (key of `[services.<name>]`) the request is for.
    pub service: String,
    pub debug: bool,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub query: Option<String>,
}

impl RequestDescriptor {
    fn query_param(&self, name: &str) -> Option<String> {
        let query = self.query.as_deref()?;
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.into_owned())
    }

    fn form_param(&self, name: &str) -> Option<String> {
        url::form_urlencoded::parse(&self.body)
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.into_owned())
    }
}

/// The single reply message of a unit.
#[derive(Debug, Clone)]
pub enum Reply {
    Cookie {
        record: AuthenticationRecord,
        cookie_name: &'static str,
    },
    Metadata(String),
    Redirect(String),
    Login {
        record: AuthenticationRecord,
        cookie_name: &'static str,
        redirect_to: String,
    },
}

/// Collaborators shared by every unit. Both are stateless handles.
#[derive(Clone)]
pub struct UnitServices {
    pub session_store: SharedSessionStore,
    pub verifier: Arc<dyn AssertionVerifier>,
}

#[derive(Clone)]
pub struct GatewayUnitFactory {
    services: UnitServices,
}

impl GatewayUnitFactory {
    pub fn new(services: UnitServices) -> Self {
        Self { services }
    }
}

impl UnitFactory for GatewayUnitFactory {
    type Unit = GatewayUnit;

    fn create(&self) -> GatewayUnit {
        GatewayUnit {
            services: self.services.clone(),
        }
    }
}

pub struct GatewayUnit {
    services: UnitServices,
}

/// State established by [`GatewayUnit::init`] for every flow.
struct ServiceContext<'a> {
    settings: &'a GatewayConfig,
    service: &'a ServiceConfig,
    loader: CredentialLoader,
    sp: ServiceProviderDescriptor,
}

#[async_trait]
impl ExecutionUnit for GatewayUnit {
    type Method = Endpoint;
    type Input = RequestDescriptor;
    type Output = Reply;

    async fn invoke(self, method: Endpoint, request: RequestDescriptor) -> Result<Reply, GatewayError> {
        tracing::debug!(
            request_id = %request.request_id,
            service = %request.service,
            "Execution unit started"
        );
        match method {
            Endpoint::Cookie => self.cookie(&request).await,
            Endpoint::Metadata => self.metadata(&request).await,
            Endpoint::SsoRedirect => self.sso_redirect(&request).await,
            Endpoint::Acs => self.acs(&request).await,
        }
    }
}

impl GatewayUnit {
    /// Load the service provider for the request's service.
    async fn init<'a>(&self, request: &'a RequestDescriptor) -> Result<ServiceContext<'a>, GatewayError> {
        let settings = request.settings.as_ref();
        let service = settings.service(&request.service)?;
        let loader = CredentialLoader::new(request.debug);
        let sp = loader.load_service_provider(service).await?;
        Ok(ServiceContext {
            settings,
            service,
            loader,
            sp,
        })
    }

    /// Synthetic record for checking cookie attributes. Not persisted.
    async fn cookie(&self, request: &RequestDescriptor) -> Result<Reply, GatewayError> {
        let ctx = self.init(request).await?;
        let app_name = request
            .query_param("appName")
            .ok_or_else(|| GatewayError::BadRequest("missing appName parameter".into()))?;
        let app = ctx.settings.app(&app_name)?;

        let record = AuthenticationRecord::new(TEST_SUBJECT, TEST_SESSION_INDEX, Utc::now())
            .with_cookie(CookiePolicy::for_app(&ctx.settings.cookie, app));

        Ok(Reply::Cookie {
            record,
            cookie_name: TEST_COOKIE_NAME,
        })
    }

    async fn metadata(&self, request: &RequestDescriptor) -> Result<Reply, GatewayError> {
        let ctx = self.init(request).await?;
        let xml = saml::render_metadata(&ctx.sp, &ctx.settings.saml.name_id_format)?;
        Ok(Reply::Metadata(xml))
    }

    async fn sso_redirect(&self, request: &RequestDescriptor) -> Result<Reply, GatewayError> {
        let ctx = self.init(request).await?;
        let raw = request
            .query_param("RelayState")
            .ok_or_else(|| GatewayError::BadRequest("missing RelayState parameter".into()))?;
        let relay_state = RelayState::parse(&raw)?;

        ctx.settings.app(&relay_state.app_name)?;
        let idp_config = ctx.settings.idp(&relay_state.idp_name)?;
        let idp = ctx
            .loader
            .load_identity_provider(&relay_state.idp_name, idp_config)
            .await?;

        let wire = RelaySigner::new(ctx.settings.saml.relay_state_secret.as_deref()).seal(&raw)?;
        let redirect =
            saml::build_login_redirect(&ctx.sp, &idp, &wire, &ctx.settings.saml.name_id_format)?;

        tracing::info!(
            request_id = %request.request_id,
            authn_request_id = %redirect.request_id,
            app = %relay_state.app_name,
            idp = %relay_state.idp_name,
            "Redirecting to identity provider"
        );
        Ok(Reply::Redirect(redirect.url))
    }

    async fn acs(&self, request: &RequestDescriptor) -> Result<Reply, GatewayError> {
        let ctx = self.init(request).await?;
        let saml_response = request
            .form_param("SAMLResponse")
            .ok_or_else(|| GatewayError::BadRequest("missing SAMLResponse field".into()))?;
        let wire = request
            .form_param("RelayState")
            .ok_or_else(|| GatewayError::BadRequest("missing RelayState field".into()))?;

        let signer = RelaySigner::new(ctx.settings.saml.relay_state_secret.as_deref());
        let relay_state = RelayState::parse(signer.open(&wire)?)?;
        let app = ctx.settings.app(&relay_state.app_name)?;
        let idp_config = ctx.settings.idp(&relay_state.idp_name)?;
        let idp = ctx
            .loader
            .load_identity_provider(&relay_state.idp_name, idp_config)
            .await?;

        let options = ValidationOptions {
            require_session_index: true,
            clock_skew: ctx.settings.saml.clock_skew(),
        };
        // XML-DSig verification is CPU bound.
        let verifier = self.services.verifier.clone();
        let sp = ctx.sp.clone();
        let claims = tokio::task::spawn_blocking(move || {
            saml::validate_assertion(verifier.as_ref(), &sp, &idp, &saml_response, &options, Utc::now())
        })
        .await
        .map_err(|e| GatewayError::UnitFault(format!("assertion validation aborted: {e}")))??;

        let record = AuthenticationRecord::new(
            &claims.subject,
            claims.session_index.unwrap_or_default(),
            Utc::now(),
        )
        .with_cookie(CookiePolicy::for_app(&ctx.settings.cookie, app))
        .with_relay_state(relay_state);

        self.services.session_store.store(&record).await?;

        tracing::info!(
            request_id = %request.request_id,
            service = %ctx.service.title,
            subject_id = %record.subject_id,
            attributes = claims.attributes.len(),
            relay_state_signed = signer.is_signing(),
            "SAML login completed"
        );

        let redirect_to = app
            .local_client_url
            .clone()
            .unwrap_or_else(|| "/".to_string());
        Ok(Reply::Login {
            record,
            cookie_name: SESSION_COOKIE_NAME,
            redirect_to,
        })
    }
}

#[cfg(all(test, feature = "database-sqlite"))]
mod tests {
    use std::time::Duration;

    use rstest::rstest;
    use tokio_util::task::TaskTracker;

    use super::*;
    use crate::{
        auth::{SessionStore, VerifiedAssertion, hash_subject},
        dispatch::Dispatcher,
        test_support::{StubVerifier, TestEnv},
    };

    #[rstest]
    #[case("cookie", Endpoint::Cookie)]
    #[case("metadata", Endpoint::Metadata)]
    #[case("sso-redirect", Endpoint::SsoRedirect)]
    #[case("acs", Endpoint::Acs)]
    fn test_endpoint_names(#[case] name: &str, #[case] endpoint: Endpoint) {
        assert_eq!(name.parse::<Endpoint>().unwrap(), endpoint);
        assert_eq!(endpoint.to_string(), name);
    }

    #[test]
    fn test_unknown_endpoint_name() {
        assert!(matches!(
            "sso_redirect".parse::<Endpoint>(),
            Err(GatewayError::UnknownEndpoint(_))
        ));
    }

    fn dispatcher(env: &TestEnv, verifier: StubVerifier) -> Dispatcher<GatewayUnitFactory> {
        Dispatcher::new(
            GatewayUnitFactory::new(env.services(verifier)),
            TaskTracker::new(),
            Duration::from_secs(10),
        )
    }

    fn acs_request(env: &TestEnv, relay_state: &str) -> RequestDescriptor {
        let body = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("SAMLResponse", "PHNhbWxwOlJlc3BvbnNlLz4=")
            .append_pair("RelayState", relay_state)
            .finish();
        RequestDescriptor {
            body: Bytes::from(body),
            ..env.request("sso", None)
        }
    }

    fn alice(encrypted: bool) -> VerifiedAssertion {
        VerifiedAssertion {
            subject: "alice@example.com".into(),
            session_index: Some("_idp-session".into()),
            encrypted,
            ..VerifiedAssertion::default()
        }
    }

    #[tokio::test]
    async fn test_acs_stores_one_record() {
        let env = TestEnv::new().await;
        let dispatcher = dispatcher(&env, StubVerifier::accepting(alice(true)));
        let relay = r#"{"origin":"x","appName":"acme","idpName":"okta"}"#;

        let reply = dispatcher
            .dispatch("acs", acs_request(&env, relay))
            .await
            .unwrap();
        let Reply::Login {
            record,
            redirect_to,
            cookie_name,
        } = reply
        else {
            panic!("expected login reply");
        };

        assert_eq!(record.subject_id, hash_subject("alice@example.com"));
        assert_eq!(record.relay_state.unwrap().app_name, "acme");
        assert_eq!(redirect_to, "https://acme.test/home");
        assert_eq!(cookie_name, SESSION_COOKIE_NAME);

        let row = env
            .store()
            .fetch(&hash_subject("alice@example.com"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.session_index, "_idp-session");
    }

    #[tokio::test]
    async fn test_acs_invalid_assertion_stores_nothing() {
        let env = TestEnv::new().await;
        let dispatcher = dispatcher(&env, StubVerifier::rejecting("untrusted signer"));
        let relay = r#"{"origin":"x","appName":"acme","idpName":"okta"}"#;

        let err = dispatcher
            .dispatch("acs", acs_request(&env, relay))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidAssertion(_)));
        assert_eq!(
            env.store()
                .fetch(&hash_subject("alice@example.com"))
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_acs_unknown_app_is_config_error() {
        let env = TestEnv::new().await;
        let dispatcher = dispatcher(&env, StubVerifier::accepting(alice(true)));
        let relay = r#"{"origin":"x","appName":"globex","idpName":"okta"}"#;

        let err = dispatcher
            .dispatch("acs", acs_request(&env, relay))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::ProtocolConfig(_)));
    }

    #[tokio::test]
    async fn test_acs_missing_fields() {
        let env = TestEnv::new().await;
        let dispatcher = dispatcher(&env, StubVerifier::accepting(alice(true)));

        let err = dispatcher
            .dispatch("acs", env.request("sso", None))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::BadRequest(_)));
    }

    #[tokio::test]
    async fn test_cookie_record_is_not_persisted() {
        let env = TestEnv::new().await;
        let dispatcher = dispatcher(&env, StubVerifier::rejecting("unused"));

        let reply = dispatcher
            .dispatch("cookie", env.request("sso", Some("appName=acme")))
            .await
            .unwrap();
        let Reply::Cookie { record, .. } = reply else {
            panic!("expected cookie reply");
        };
        assert_eq!(record.subject_id, hash_subject("test-user"));
        assert_eq!(record.cookie.unwrap().max_age_ms, 300_000);
        assert_eq!(env.store().fetch(&record.subject_id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_sso_redirect_unknown_idp() {
        let env = TestEnv::new().await;
        let dispatcher = dispatcher(&env, StubVerifier::rejecting("unused"));
        let query = url::form_urlencoded::Serializer::new(String::new())
            .append_pair(
                "RelayState",
                r#"{"origin":"x","appName":"acme","idpName":"azure"}"#,
            )
            .finish();

        let err = dispatcher
            .dispatch("sso-redirect", env.request("sso", Some(&query)))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::ProtocolConfig(_)));
    }
}
