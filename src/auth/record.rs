use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tower_cookies::{
    Cookie,
    cookie::{SameSite as CookieSameSite, time::Duration as CookieDuration},
};

use super::RelayState;
use crate::{
    config::{AppConfig, CookieConfig, SameSite},
    error::GatewayError,
};

/// SHA-256 hex digest of an IdP subject identifier.
///
/// This is the only form in which a subject is stored or logged.
pub fn hash_subject(subject: &str) -> String {
    hex::encode(Sha256::digest(subject.as_bytes()))
}

/// Attributes of the cookie that carries an [`AuthenticationRecord`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CookiePolicy {
    pub secure: bool,
    pub domain: Option<String>,
    pub path: String,
    pub same_site: SameSite,
    pub max_age_ms: u64,
}

impl CookiePolicy {
    pub fn for_app(cookie: &CookieConfig, app: &AppConfig) -> Self {
        Self {
            secure: cookie.secure,
            domain: app.cookie_domain.clone(),
            path: app.cookie_path.clone(),
            same_site: app.same_site,
            max_age_ms: cookie.max_age_ms(),
        }
    }
}

/// One successful authentication, as handed to the legacy application.
///
/// Created once per login, moved out of the execution unit by value and
/// never modified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticationRecord {
    /// [`hash_subject`] of the IdP identifier.
    pub subject_id: String,
    pub session_index: String,
    pub authenticated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relay_state: Option<RelayState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cookie: Option<CookiePolicy>,
}

impl AuthenticationRecord {
    /// Build a record for a raw IdP subject. The subject is hashed here and
    /// not kept.
    pub fn new(
        subject: &str,
        session_index: impl Into<String>,
        authenticated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            subject_id: hash_subject(subject),
            session_index: session_index.into(),
            authenticated_at,
            relay_state: None,
            cookie: None,
        }
    }

    pub fn with_relay_state(mut self, relay_state: RelayState) -> Self {
        self.relay_state = Some(relay_state);
        self
    }

    pub fn with_cookie(mut self, cookie: CookiePolicy) -> Self {
        self.cookie = Some(cookie);
        self
    }

    /// Cookie value: base64url (unpadded) of the record's JSON.
    pub fn cookie_value(&self) -> Result<String, GatewayError> {
        let json = serde_json::to_vec(self)
            .map_err(|e| GatewayError::UnitFault(format!("failed to encode record: {e}")))?;
        Ok(URL_SAFE_NO_PAD.encode(json))
    }

    /// Build the `Set-Cookie` for this record. `HttpOnly` is always set.
    pub fn to_cookie(&self, name: &str) -> Result<Cookie<'static>, GatewayError> {
        let value = self.cookie_value()?;
        let mut builder = Cookie::build((name.to_string(), value)).http_only(true);

        if let Some(policy) = &self.cookie {
            let same_site = match policy.same_site {
                SameSite::Strict => CookieSameSite::Strict,
                SameSite::Lax => CookieSameSite::Lax,
                SameSite::None => CookieSameSite::None,
            };
            let max_age_secs = i64::try_from(policy.max_age_ms / 1000).unwrap_or(i64::MAX);
            builder = builder
                .secure(policy.secure)
                .path(policy.path.clone())
                .same_site(same_site)
                .max_age(CookieDuration::seconds(max_age_secs));
            if let Some(domain) = &policy.domain {
                builder = builder.domain(domain.clone());
            }
        }

        Ok(builder.build())
    }
}
