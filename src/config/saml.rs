use serde::{Deserialize, Serialize};

use super::ConfigError;

pub const DEFAULT_NAME_ID_FORMAT: &str = "urn:oasis:names:tc:SAML:1.1:nameid-format:emailAddress";

/// Global attributes of the cookies handed to legacy applications.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CookieConfig {
    /// Only send the cookie over HTTPS.
    #[serde(default = "default_true")]
    pub secure: bool,

    /// Cookie lifetime in minutes.
    #[serde(default = "default_timeout_minutes")]
    pub timeout_minutes: u64,
}

impl Default for CookieConfig {
    fn default() -> Self {
        Self {
            secure: true,
            timeout_minutes: default_timeout_minutes(),
        }
    }
}

/// One year.
const MAX_COOKIE_TIMEOUT_MINUTES: u64 = 525_600;

impl CookieConfig {
    pub fn max_age_ms(&self) -> u64 {
        self.timeout_minutes.saturating_mul(60_000)
    }

    pub(super) fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout_minutes > MAX_COOKIE_TIMEOUT_MINUTES {
            return Err(ConfigError::Validation(format!(
                "cookie.timeout_minutes must be at most {MAX_COOKIE_TIMEOUT_MINUTES}"
            )));
        }
        Ok(())
    }
}

fn default_timeout_minutes() -> u64 {
    60
}

/// Protocol-wide SAML settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SamlConfig {
    /// Secret used to HMAC-sign the RelayState. When unset the RelayState
    /// travels unsigned.
    #[serde(default)]
    pub relay_state_secret: Option<String>,

    /// Tolerated clock difference with the IdP, in seconds.
    #[serde(default = "default_clock_skew")]
    pub clock_skew_secs: u64,

    /// NameID format requested from the IdP and advertised in metadata.
    #[serde(default = "default_name_id_format")]
    pub name_id_format: String,
}

impl Default for SamlConfig {
    fn default() -> Self {
        Self {
            relay_state_secret: None,
            clock_skew_secs: default_clock_skew(),
            name_id_format: default_name_id_format(),
        }
    }
}

impl SamlConfig {
    pub fn clock_skew(&self) -> chrono::Duration {
        i64::try_from(self.clock_skew_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or_else(|| chrono::Duration::seconds(120))
    }
}

fn default_clock_skew() -> u64 {
    120
}

fn default_name_id_format() -> String {
    DEFAULT_NAME_ID_FORMAT.to_string()
}

/// A service provider hosted by the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceConfig {
    /// Path prefix the service's endpoints are nested under.
    pub base_path: String,

    /// Human-readable title, used as the prefix of every response body.
    /// Defaults to the service name.
    #[serde(default)]
    pub title: String,

    /// SAML entity ID of this service provider.
    pub entity_id: String,

    /// Assertion Consumer Service URL. Derived from the entity ID when omitted.
    #[serde(default)]
    pub acs_url: Option<String>,

    /// Accept assertions that arrive unencrypted.
    #[serde(default)]
    pub allow_unencrypted_assertion: bool,

    /// PEM private key used to sign AuthnRequests and decrypt assertions.
    pub private_key_path: String,

    /// PEM certificate matching the private key, published in metadata.
    pub certificate_path: String,
}

impl ServiceConfig {
    pub fn acs_url(&self) -> String {
        self.acs_url
            .clone()
            .unwrap_or_else(|| crate::auth::saml::derive_acs_url(&self.entity_id))
    }

    pub(super) fn validate(&mut self, name: &str) -> Result<(), ConfigError> {
        if !self.base_path.starts_with('/') {
            return Err(ConfigError::Validation(format!(
                "services.{name}.base_path must start with '/'"
            )));
        }
        if self.entity_id.trim().is_empty() {
            return Err(ConfigError::Validation(format!(
                "services.{name}.entity_id cannot be empty"
            )));
        }
        if self.private_key_path.is_empty() || self.certificate_path.is_empty() {
            return Err(ConfigError::Validation(format!(
                "services.{name} requires private_key_path and certificate_path"
            )));
        }
        if self.title.is_empty() {
            self.title = name.to_string();
        }
        Ok(())
    }
}

/// A legacy application that consumes authenticated sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    #[serde(default)]
    pub cookie_domain: Option<String>,

    #[serde(default = "default_cookie_path")]
    pub cookie_path: String,

    #[serde(default)]
    pub same_site: SameSite,

    /// Where the browser lands after a successful login.
    #[serde(default)]
    pub local_client_url: Option<String>,
}

impl AppConfig {
    pub(super) fn validate(&self, name: &str) -> Result<(), ConfigError> {
        if !self.cookie_path.starts_with('/') {
            return Err(ConfigError::Validation(format!(
                "apps.{name}.cookie_path must start with '/'"
            )));
        }
        if let Some(target) = &self.local_client_url
            && target.is_empty()
        {
            return Err(ConfigError::Validation(format!(
                "apps.{name}.local_client_url cannot be empty"
            )));
        }
        Ok(())
    }
}

fn default_cookie_path() -> String {
    "/".to_string()
}

/// A trusted identity provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IdpConfig {
    /// SingleSignOnService URL (HTTP-Redirect binding).
    pub login_url: String,

    #[serde(default)]
    pub logout_url: Option<String>,

    /// PEM certificates any one of which may sign this IdP's responses.
    pub certificate_paths: Vec<String>,
}

impl IdpConfig {
    pub(super) fn validate(&self, name: &str) -> Result<(), ConfigError> {
        if self.login_url.is_empty() {
            return Err(ConfigError::Validation(format!(
                "idps.{name}.login_url cannot be empty"
            )));
        }
        if self.certificate_paths.is_empty() {
            return Err(ConfigError::Validation(format!(
                "idps.{name} requires at least one entry in certificate_paths"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SameSite {
    #[default]
    Strict,
    Lax,
    None,
}

fn default_true() -> bool {
    true
}
