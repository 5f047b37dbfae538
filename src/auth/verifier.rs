//! XML signature verification and assertion decoding.
//!
//! [`AssertionVerifier`] is the seam between the protocol engine and the
//! XML-DSig implementation. Production uses [`SamaelVerifier`]; tests swap
//! in a verifier that returns canned assertions.

use std::collections::BTreeMap;

use base64::{Engine, engine::general_purpose::STANDARD};
use chrono::{DateTime, Utc};

use super::{IdentityProviderDescriptor, ServiceProviderDescriptor};
use crate::error::GatewayError;

/// An assertion whose signature has been checked against one of the IdP's
/// trusted certificates. Policy checks (time window, encryption, session
/// index) are left to the engine.
#[derive(Debug, Clone, Default)]
pub struct VerifiedAssertion {
    pub subject: String,
    pub session_index: Option<String>,
    pub not_before: Option<DateTime<Utc>>,
    pub not_on_or_after: Option<DateTime<Utc>>,
    pub attributes: BTreeMap<String, Vec<String>>,
    /// The response carried an `EncryptedAssertion`.
    pub encrypted: bool,
}

pub trait AssertionVerifier: Send + Sync {
    /// Verify a base64 encoded `SAMLResponse`.
    fn verify(
        &self,
        sp: &ServiceProviderDescriptor,
        idp: &IdentityProviderDescriptor,
        saml_response_b64: &str,
    ) -> Result<VerifiedAssertion, GatewayError>;
}

/// Verifier backed by samael (libxmlsec1).
#[derive(Debug, Clone, Default)]
pub struct SamaelVerifier {
    /// Forwarded to samael's own condition checks.
    pub clock_skew: chrono::Duration,
}

impl SamaelVerifier {
    pub fn new(clock_skew: chrono::Duration) -> Self {
        Self { clock_skew }
    }
}

impl AssertionVerifier for SamaelVerifier {
    fn verify(
        &self,
        sp: &ServiceProviderDescriptor,
        idp: &IdentityProviderDescriptor,
        saml_response_b64: &str,
    ) -> Result<VerifiedAssertion, GatewayError> {
        // Browsers may wrap the form field; samael expects a single line.
        let compact: String = saml_response_b64
            .chars()
            .filter(|c| !c.is_ascii_whitespace())
            .collect();
        let response_bytes = STANDARD.decode(&compact).map_err(|e| {
            tracing::debug!(error = %e, "Failed to decode SAML response base64");
            GatewayError::InvalidAssertion("SAMLResponse is not valid base64".into())
        })?;
        let response_xml = String::from_utf8(response_bytes).map_err(|_| {
            GatewayError::InvalidAssertion("SAMLResponse is not valid UTF-8".into())
        })?;
        let encrypted = carries_encrypted_assertion(&response_xml)?;

        tracing::debug!(
            xml_len = response_xml.len(),
            idp = %idp.name,
            encrypted,
            "Verifying SAML response"
        );

        let mut assertion = self.verify_signed(sp, idp, &compact)?;
        assertion.encrypted = encrypted;
        Ok(assertion)
    }
}

/// Whether the response element itself holds an `EncryptedAssertion`.
///
/// Decided from the parsed document, so text content that merely mentions
/// the element name does not count.
fn carries_encrypted_assertion(response_xml: &str) -> Result<bool, GatewayError> {
    let response: samael::schema::Response = response_xml.parse().map_err(|e| {
        tracing::debug!(error = %e, "Failed to parse SAML response");
        GatewayError::InvalidAssertion("SAMLResponse is not a SAML 2.0 Response".into())
    })?;
    Ok(response.encrypted_assertion.is_some())
}

impl SamaelVerifier {
    #[cfg(feature = "xmlsec")]
    fn verify_signed(
        &self,
        sp: &ServiceProviderDescriptor,
        idp: &IdentityProviderDescriptor,
        saml_response_b64: &str,
    ) -> Result<VerifiedAssertion, GatewayError> {
        use openssl::{pkey::PKey, x509::X509};
        use samael::service_provider::ServiceProviderBuilder;

        let key = PKey::private_key_from_pem(sp.private_key.as_bytes()).map_err(|e| {
            GatewayError::ProtocolConfig(format!("Failed to parse SP private key: {e}"))
        })?;
        let certificate = X509::from_pem(sp.certificate.as_bytes()).map_err(|e| {
            GatewayError::ProtocolConfig(format!("Failed to parse SP certificate: {e}"))
        })?;

        let mut last_error = None;
        for (index, trusted) in idp.trusted_certificates.iter().enumerate() {
            let idp_metadata = super::saml::build_idp_metadata(idp, Some(trusted))?;
            let service_provider = ServiceProviderBuilder::default()
                .entity_id(sp.entity_id.clone())
                .acs_url(sp.acs_url.clone())
                .idp_metadata(idp_metadata)
                .key(key.clone())
                .certificate(certificate.clone())
                .allow_idp_initiated(true)
                .max_clock_skew(self.clock_skew)
                .build()
                .map_err(|e| {
                    GatewayError::ProtocolConfig(format!("Failed to build ServiceProvider: {e}"))
                })?;

            match service_provider.parse_base64_response(saml_response_b64, None) {
                Ok(assertion) => {
                    tracing::debug!(idp = %idp.name, certificate = index, "SAML response verified");
                    return from_samael(assertion);
                }
                Err(e) => {
                    tracing::debug!(
                        idp = %idp.name,
                        certificate = index,
                        error = %e,
                        "SAML response rejected by trusted certificate"
                    );
                    last_error = Some(e.to_string());
                }
            }
        }

        Err(GatewayError::InvalidAssertion(last_error.unwrap_or_else(
            || format!("identity provider '{}' has no trusted certificates", idp.name),
        )))
    }

    /// Without libxmlsec1 signatures cannot be checked, so nothing is accepted.
    #[cfg(not(feature = "xmlsec"))]
    fn verify_signed(
        &self,
        _sp: &ServiceProviderDescriptor,
        _idp: &IdentityProviderDescriptor,
        _saml_response_b64: &str,
    ) -> Result<VerifiedAssertion, GatewayError> {
        Err(GatewayError::ProtocolConfig(
            "gateway was built without XML signature verification (enable the `xmlsec` feature)"
                .into(),
        ))
    }
}

#[cfg(feature = "xmlsec")]
fn from_samael(assertion: samael::schema::Assertion) -> Result<VerifiedAssertion, GatewayError> {
    let subject = assertion
        .subject
        .as_ref()
        .and_then(|s| s.name_id.as_ref())
        .map(|n| n.value.clone())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| GatewayError::InvalidAssertion("assertion missing NameID".into()))?;

    let session_index = assertion
        .authn_statements
        .as_ref()
        .and_then(|stmts| stmts.first())
        .and_then(|stmt| stmt.session_index.clone());

    let mut attributes: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for statement in assertion.attribute_statements.iter().flatten() {
        for attr in &statement.attributes {
            let Some(name) = attr.name.clone() else {
                continue;
            };
            let values: Vec<String> = attr.values.iter().filter_map(|v| v.value.clone()).collect();
            attributes.entry(name).or_default().extend(values);
        }
    }

    let (not_before, not_on_or_after) = assertion
        .conditions
        .as_ref()
        .map(|c| (c.not_before, c.not_on_or_after))
        .unwrap_or_default();

    Ok(VerifiedAssertion {
        subject,
        session_index,
        not_before,
        not_on_or_after,
        attributes,
        encrypted: false,
    })
}
