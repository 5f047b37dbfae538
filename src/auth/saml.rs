//! SAML 2.0 protocol engine.
//!
//! Three stateless operations on immutable descriptors:
//! - SP metadata rendering
//! - AuthnRequest generation and signing (HTTP-Redirect binding)
//! - Response validation and claim extraction
//!
//! No state is kept between the redirect and the ACS post. The IdP is
//! never contacted directly.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use openssl::pkey::PKey;
use samael::{metadata::EntityDescriptor, service_provider::ServiceProviderBuilder};

use super::{AssertionVerifier, IdentityProviderDescriptor, ServiceProviderDescriptor};
use crate::error::GatewayError;

/// A login redirect ready to be sent to the browser.
#[derive(Debug, Clone)]
pub struct LoginRedirect {
    pub url: String,
    /// ID of the AuthnRequest, for correlating logs with the IdP.
    pub request_id: String,
}

#[derive(Debug, Clone, Copy)]
pub struct ValidationOptions {
    pub require_session_index: bool,
    pub clock_skew: chrono::Duration,
}

impl Default for ValidationOptions {
    fn default() -> Self {
        Self {
            require_session_index: true,
            clock_skew: chrono::Duration::seconds(120),
        }
    }
}

/// Identity extracted from a validated assertion. The subject is the raw
/// IdP identifier; hashing happens in the session bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityClaims {
    pub subject: String,
    pub session_index: Option<String>,
    pub attributes: BTreeMap<String, Vec<String>>,
}

/// Generate SP metadata XML for IdP configuration.
///
/// The metadata includes:
/// - SP entity ID
/// - Signing certificate, and the same certificate for encryption unless
///   unencrypted assertions are allowed
/// - NameID format
/// - Assertion Consumer Service (ACS) URL with HTTP-POST binding
pub fn render_metadata(
    sp: &ServiceProviderDescriptor,
    name_id_format: &str,
) -> Result<String, GatewayError> {
    if sp.entity_id.trim().is_empty() {
        return Err(GatewayError::ProtocolConfig(
            "service provider entity id is empty".into(),
        ));
    }
    if sp.acs_url.trim().is_empty() {
        return Err(GatewayError::ProtocolConfig(
            "service provider ACS URL is empty".into(),
        ));
    }

    let mut xml = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<md:EntityDescriptor xmlns:md="urn:oasis:names:tc:SAML:2.0:metadata" entityID="{}">
  <md:SPSSODescriptor AuthnRequestsSigned="true" WantAssertionsSigned="true" protocolSupportEnumeration="urn:oasis:names:tc:SAML:2.0:protocol">"#,
        escape_xml(&sp.entity_id)
    );

    let cert_data = strip_pem_headers(&sp.certificate);
    let uses: &[&str] = if sp.allow_unencrypted_assertion {
        &["signing"]
    } else {
        &["signing", "encryption"]
    };
    for usage in uses {
        xml.push_str(&format!(
            r#"
    <md:KeyDescriptor use="{}">
      <ds:KeyInfo xmlns:ds="http://www.w3.org/2000/09/xmldsig#">
        <ds:X509Data>
          <ds:X509Certificate>{}</ds:X509Certificate>
        </ds:X509Data>
      </ds:KeyInfo>
    </md:KeyDescriptor>"#,
            usage, cert_data
        ));
    }

    xml.push_str(&format!(
        r#"
    <md:NameIDFormat>{}</md:NameIDFormat>
    <md:AssertionConsumerService
        Binding="urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST"
        Location="{}"
        index="0"/>
  </md:SPSSODescriptor>
</md:EntityDescriptor>"#,
        escape_xml(name_id_format),
        escape_xml(&sp.acs_url)
    ));

    Ok(xml)
}

/// Build the HTTP-Redirect URL that sends the browser to the IdP.
///
/// `relay_state` is forwarded verbatim (URL encoded). The request is signed
/// with the SP key when one is configured.
pub fn build_login_redirect(
    sp: &ServiceProviderDescriptor,
    idp: &IdentityProviderDescriptor,
    relay_state: &str,
    name_id_format: &str,
) -> Result<LoginRedirect, GatewayError> {
    if idp.login_url.trim().is_empty() {
        return Err(GatewayError::ProtocolConfig(format!(
            "identity provider '{}' has no login URL",
            idp.name
        )));
    }

    let idp_metadata = build_idp_metadata(idp, idp.trusted_certificates.first().map(String::as_str))?;
    let service_provider = ServiceProviderBuilder::default()
        .entity_id(sp.entity_id.clone())
        .acs_url(sp.acs_url.clone())
        .idp_metadata(idp_metadata)
        .authn_name_id_format(name_id_format.to_string())
        .build()
        .map_err(|e| {
            GatewayError::ProtocolConfig(format!("Failed to build ServiceProvider: {}", e))
        })?;

    let authn_request = service_provider
        .make_authentication_request(&idp.login_url)
        .map_err(|e| GatewayError::ProtocolConfig(format!("Failed to create AuthnRequest: {}", e)))?;
    let request_id = authn_request.id.clone();

    let url = if sp.private_key.trim().is_empty() {
        authn_request
            .redirect(relay_state)
            .map_err(|e| GatewayError::ProtocolConfig(format!("Failed to encode AuthnRequest: {}", e)))?
    } else {
        let private_key = PKey::private_key_from_pem(sp.private_key.as_bytes()).map_err(|e| {
            GatewayError::ProtocolConfig(format!(
                "Failed to parse SP private key (expected PEM format): {}",
                e
            ))
        })?;
        authn_request
            .signed_redirect(relay_state, private_key)
            .map_err(|e| GatewayError::ProtocolConfig(format!("Failed to sign AuthnRequest: {}", e)))?
    };
    let url =
        url.ok_or_else(|| GatewayError::ProtocolConfig("AuthnRequest has no destination".into()))?;

    tracing::debug!(idp = %idp.name, request_id = %request_id, "Created SAML AuthnRequest redirect");

    Ok(LoginRedirect {
        url: url.to_string(),
        request_id,
    })
}

/// Validate a posted `SAMLResponse` and extract the identity it asserts.
///
/// The signature is checked by `verifier` against any one of the IdP's
/// trusted certificates. The engine then enforces the encryption policy,
/// the NotBefore / NotOnOrAfter window (widened by the clock skew) and,
/// when asked, the presence of a session index.
pub fn validate_assertion(
    verifier: &dyn AssertionVerifier,
    sp: &ServiceProviderDescriptor,
    idp: &IdentityProviderDescriptor,
    saml_response: &str,
    options: &ValidationOptions,
    now: DateTime<Utc>,
) -> Result<IdentityClaims, GatewayError> {
    if saml_response.trim().is_empty() {
        return Err(GatewayError::InvalidAssertion("empty SAMLResponse".into()));
    }

    let assertion = verifier.verify(sp, idp, saml_response)?;

    if !assertion.encrypted && !sp.allow_unencrypted_assertion {
        return Err(GatewayError::InvalidAssertion(
            "unencrypted assertions are not accepted by this service".into(),
        ));
    }

    if let Some(not_before) = assertion.not_before
        && now + options.clock_skew < not_before
    {
        return Err(GatewayError::InvalidAssertion(format!(
            "assertion not valid before {not_before}"
        )));
    }
    if let Some(not_on_or_after) = assertion.not_on_or_after
        && now - options.clock_skew >= not_on_or_after
    {
        return Err(GatewayError::InvalidAssertion(format!(
            "assertion expired at {not_on_or_after}"
        )));
    }

    let session_index = assertion.session_index.filter(|s| !s.is_empty());
    if options.require_session_index && session_index.is_none() {
        return Err(GatewayError::MissingSessionIndex);
    }

    Ok(IdentityClaims {
        subject: assertion.subject,
        session_index,
        attributes: assertion.attributes,
    })
}

/// Minimal IdP metadata, optionally carrying one signing certificate.
pub(crate) fn build_idp_metadata(
    idp: &IdentityProviderDescriptor,
    signing_certificate: Option<&str>,
) -> Result<EntityDescriptor, GatewayError> {
    let key_descriptor = signing_certificate
        .map(|pem| {
            format!(
                r#"<md:KeyDescriptor use="signing">
            <ds:KeyInfo xmlns:ds="http://www.w3.org/2000/09/xmldsig#">
                <ds:X509Data>
                    <ds:X509Certificate>{}</ds:X509Certificate>
                </ds:X509Data>
            </ds:KeyInfo>
        </md:KeyDescriptor>"#,
                strip_pem_headers(pem)
            )
        })
        .unwrap_or_default();
    let logout = idp
        .logout_url
        .as_ref()
        .map(|url| {
            format!(
                r#"<md:SingleLogoutService Binding="urn:oasis:names:tc:SAML:2.0:bindings:HTTP-Redirect" Location="{}"/>"#,
                escape_xml(url)
            )
        })
        .unwrap_or_default();

    let xml = format!(
        r#"<md:EntityDescriptor xmlns:md="urn:oasis:names:tc:SAML:2.0:metadata" entityID="{}">
    <md:IDPSSODescriptor protocolSupportEnumeration="urn:oasis:names:tc:SAML:2.0:protocol">
        {}
        {}
        <md:SingleSignOnService Binding="urn:oasis:names:tc:SAML:2.0:bindings:HTTP-Redirect" Location="{}"/>
    </md:IDPSSODescriptor>
</md:EntityDescriptor>"#,
        escape_xml(&idp.name),
        key_descriptor,
        logout,
        escape_xml(&idp.login_url),
    );

    samael::metadata::de::from_str(&xml).map_err(|e| {
        GatewayError::ProtocolConfig(format!(
            "Failed to build metadata for identity provider '{}': {}",
            idp.name, e
        ))
    })
}

/// Strip PEM headers and line breaks from a certificate.
pub(crate) fn strip_pem_headers(pem: &str) -> String {
    pem.lines()
        .filter(|line| !line.starts_with("-----BEGIN") && !line.starts_with("-----END"))
        .map(str::trim)
        .collect::<Vec<_>>()
        .join("")
}

pub(crate) fn escape_xml(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

/// Derive the ACS URL of a service from its entity ID.
///
/// Services are mounted at the path of their entity ID, so the ACS lives
/// right below it:
///
/// - `https://gateway.example.com/sso` → `https://gateway.example.com/sso/acs`
/// - `https://gateway.example.com/` → `https://gateway.example.com/acs`
pub fn derive_acs_url(entity_id: &str) -> String {
    format!("{}/acs", entity_id.trim_end_matches('/'))
}
