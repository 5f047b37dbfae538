//! RelayState: the only continuity token between `/sso-redirect` and `/acs`.
//!
//! The browser supplies a JSON object naming the target application and
//! identity provider. The gateway forwards the exact bytes it received to
//! the IdP and parses them again when the IdP posts back, so the names seen
//! at the ACS are the names chosen at redirect time.
//!
//! When `saml.relay_state_secret` is configured the forwarded value is
//! `<json>.<tag>`, where `tag` is an HMAC-SHA256 over the JSON. Without a
//! secret the value travels unsigned; the names it carries can then only
//! select among configured applications and identity providers.

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::GatewayError;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RelayState {
    /// Where the login was started from. Opaque to the gateway.
    pub origin: String,
    pub app_name: String,
    pub idp_name: String,
}

impl RelayState {
    pub fn parse(raw: &str) -> Result<Self, GatewayError> {
        serde_json::from_str(raw)
            .map_err(|e| GatewayError::BadRequest(format!("malformed RelayState: {e}")))
    }
}

/// Seals and opens RelayState values.
#[derive(Clone)]
pub struct RelaySigner {
    key: Option<Vec<u8>>,
}

impl std::fmt::Debug for RelaySigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelaySigner")
            .field("signed", &self.key.is_some())
            .finish()
    }
}

impl RelaySigner {
    pub fn new(secret: Option<&str>) -> Self {
        Self {
            key: secret.map(|s| s.as_bytes().to_vec()),
        }
    }

    pub fn is_signing(&self) -> bool {
        self.key.is_some()
    }

    /// Wire form of `raw`: unchanged, or with a `.tag` suffix when signing.
    pub fn seal(&self, raw: &str) -> Result<String, GatewayError> {
        let Some(key) = &self.key else {
            return Ok(raw.to_string());
        };
        let tag = Self::mac(key, raw)?.finalize().into_bytes();
        Ok(format!("{raw}.{}", URL_SAFE_NO_PAD.encode(tag)))
    }

    /// Recover the raw RelayState from its wire form, verifying the tag
    /// when signing is enabled.
    pub fn open<'a>(&self, wire: &'a str) -> Result<&'a str, GatewayError> {
        let Some(key) = &self.key else {
            return Ok(wire);
        };
        let tampered = || GatewayError::InvalidAssertion("RelayState signature mismatch".into());

        let (raw, tag) = wire.rsplit_once('.').ok_or_else(tampered)?;
        let tag = URL_SAFE_NO_PAD.decode(tag).map_err(|_| tampered())?;
        Self::mac(key, raw)?
            .verify_slice(&tag)
            .map_err(|_| tampered())?;
        Ok(raw)
    }

    fn mac(key: &[u8], raw: &str) -> Result<HmacSha256, GatewayError> {
        let mut mac = HmacSha256::new_from_slice(key)
            .map_err(|e| GatewayError::ProtocolConfig(format!("invalid RelayState key: {e}")))?;
        mac.update(raw.as_bytes());
        Ok(mac)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    const SECRET: &str = "0123456789abcdef0123456789abcdef";

    #[test]
    fn test_parse_reproduces_names() {
        let state =
            RelayState::parse(r#"{"origin":"x","appName":"acme","idpName":"okta"}"#).unwrap();
        assert_eq!(state.origin, "x");
        assert_eq!(state.app_name, "acme");
        assert_eq!(state.idp_name, "okta");
    }

    #[rstest]
    #[case::empty("")]
    #[case::not_json("acme")]
    #[case::missing_idp(r#"{"origin":"x","appName":"acme"}"#)]
    #[case::snake_case(r#"{"origin":"x","app_name":"acme","idp_name":"okta"}"#)]
    #[case::extra_field(r#"{"origin":"x","appName":"a","idpName":"b","admin":true}"#)]
    #[case::wrong_type(r#"{"origin":1,"appName":"acme","idpName":"okta"}"#)]
    fn test_parse_rejects(#[case] raw: &str) {
        assert!(matches!(
            RelayState::parse(raw),
            Err(GatewayError::BadRequest(_))
        ));
    }

    #[test]
    fn test_unsigned_is_passthrough() {
        let signer = RelaySigner::new(None);
        let raw = r#"{"origin":"https://acme.test","appName":"acme","idpName":"okta"}"#;
        let wire = signer.seal(raw).unwrap();
        assert_eq!(wire, raw);
        assert_eq!(signer.open(&wire).unwrap(), raw);
    }

    #[test]
    fn test_signed_round_trip() {
        let signer = RelaySigner::new(Some(SECRET));
        let raw = r#"{"origin":"https://acme.test","appName":"acme","idpName":"okta"}"#;
        let wire = signer.seal(raw).unwrap();
        assert_ne!(wire, raw);
        assert!(wire.starts_with(raw));
        assert_eq!(signer.open(&wire).unwrap(), raw);
    }

    #[rstest]
    #[case::no_tag(r#"{"origin":"x","appName":"acme","idpName":"okta"}"#)]
    #[case::bad_base64(r#"{"origin":"x","appName":"acme","idpName":"okta"}.!!"#)]
    #[case::wrong_tag(r#"{"origin":"x","appName":"acme","idpName":"okta"}.AAAA"#)]
    fn test_signed_rejects(#[case] wire: &str) {
        let signer = RelaySigner::new(Some(SECRET));
        assert!(matches!(
            signer.open(wire),
            Err(GatewayError::InvalidAssertion(_))
        ));
    }

    #[test]
    fn test_tampered_app_name_rejected() {
        let signer = RelaySigner::new(Some(SECRET));
        let wire = signer
            .seal(r#"{"origin":"x","appName":"acme","idpName":"okta"}"#)
            .unwrap();
        let tampered = wire.replace("acme", "evil");
        assert!(signer.open(&tampered).is_err());
    }

    #[test]
    fn test_other_key_rejected() {
        let wire = RelaySigner::new(Some(SECRET))
            .seal(r#"{"origin":"x","appName":"acme","idpName":"okta"}"#)
            .unwrap();
        let other = RelaySigner::new(Some("ffffffffffffffffffffffffffffffff"));
        assert!(other.open(&wire).is_err());
    }
}
