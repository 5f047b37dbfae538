//! Shared fixtures for unit tests.

use std::{
    path::{Path, PathBuf},
    sync::OnceLock,
};

#[cfg(feature = "database-sqlite")]
use std::sync::Arc;

#[cfg(feature = "database-sqlite")]
use bytes::Bytes;
#[cfg(feature = "database-sqlite")]
use http::HeaderMap;
#[cfg(feature = "database-sqlite")]
use uuid::Uuid;

use crate::{
    auth::{
        AssertionVerifier, IdentityProviderDescriptor, ServiceProviderDescriptor,
        VerifiedAssertion,
    },
    error::GatewayError,
};
#[cfg(feature = "database-sqlite")]
use crate::{
    auth::{SqlSessionStore, session_store::run_migrations},
    config::{DatabaseConfig, GatewayConfig, SqliteConfig},
    dispatch::{RequestDescriptor, UnitServices},
};

/// Generate a self-signed X.509 certificate and private key.
///
/// Returns (certificate_pem, private_key_pem).
pub fn generate_test_certificate(common_name: &str) -> (String, String) {
    use openssl::{
        asn1::Asn1Time,
        bn::BigNum,
        hash::MessageDigest,
        pkey::PKey,
        rsa::Rsa,
        x509::{X509Builder, X509NameBuilder},
    };

    let rsa = Rsa::generate(2048).unwrap();
    let private_key = PKey::from_rsa(rsa).unwrap();

    let mut x509_name = X509NameBuilder::new().unwrap();
    x509_name.append_entry_by_text("CN", common_name).unwrap();
    let x509_name = x509_name.build();

    let mut builder = X509Builder::new().unwrap();
    builder.set_version(2).unwrap();
    let serial_number = BigNum::from_u32(1).unwrap();
    builder
        .set_serial_number(&serial_number.to_asn1_integer().unwrap())
        .unwrap();
    builder.set_subject_name(&x509_name).unwrap();
    builder.set_issuer_name(&x509_name).unwrap();
    builder.set_pubkey(&private_key).unwrap();
    builder
        .set_not_before(&Asn1Time::days_from_now(0).unwrap())
        .unwrap();
    builder
        .set_not_after(&Asn1Time::days_from_now(365).unwrap())
        .unwrap();
    builder.sign(&private_key, MessageDigest::sha256()).unwrap();

    let cert = builder.build();
    let cert_pem = String::from_utf8(cert.to_pem().unwrap()).unwrap();
    let key_pem = String::from_utf8(private_key.private_key_to_pem_pkcs8().unwrap()).unwrap();

    (cert_pem, key_pem)
}

pub fn write_file(dir: &Path, name: &str, content: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, content).unwrap();
    path
}

/// RSA generation is slow; every test shares one SP and one IdP key pair.
fn sp_credentials() -> &'static (String, String) {
    static PAIR: OnceLock<(String, String)> = OnceLock::new();
    PAIR.get_or_init(|| generate_test_certificate("gateway.example.com"))
}

fn idp_credentials() -> &'static (String, String) {
    static PAIR: OnceLock<(String, String)> = OnceLock::new();
    PAIR.get_or_init(|| generate_test_certificate("idp.example.com"))
}

/// A key pair the test IdP does not own.
fn foreign_credentials() -> &'static (String, String) {
    static PAIR: OnceLock<(String, String)> = OnceLock::new();
    PAIR.get_or_init(|| generate_test_certificate("attacker.example.com"))
}

pub fn idp_certificate() -> String {
    idp_credentials().0.clone()
}

pub fn foreign_certificate() -> String {
    foreign_credentials().0.clone()
}

pub fn test_sp(allow_unencrypted_assertion: bool) -> ServiceProviderDescriptor {
    let (certificate, private_key) = sp_credentials().clone();
    ServiceProviderDescriptor {
        entity_id: "https://gateway.example.com/sso".into(),
        acs_url: "https://gateway.example.com/sso/acs".into(),
        private_key,
        certificate,
        allow_unencrypted_assertion,
    }
}

pub fn test_idp() -> IdentityProviderDescriptor {
    IdentityProviderDescriptor {
        name: "okta".into(),
        login_url: "https://idp.example.com/sso/saml".into(),
        logout_url: None,
        trusted_certificates: vec![idp_credentials().0.clone()],
    }
}

/// Verifier returning a canned result, for exercising the engine and the
/// flows without XML signatures.
#[derive(Debug, Clone)]
pub struct StubVerifier {
    result: Result<VerifiedAssertion, String>,
}

impl StubVerifier {
    pub fn accepting(assertion: VerifiedAssertion) -> Self {
        Self {
            result: Ok(assertion),
        }
    }

    pub fn rejecting(reason: &str) -> Self {
        Self {
            result: Err(reason.to_string()),
        }
    }
}

impl AssertionVerifier for StubVerifier {
    fn verify(
        &self,
        _sp: &ServiceProviderDescriptor,
        _idp: &IdentityProviderDescriptor,
        _saml_response_b64: &str,
    ) -> Result<VerifiedAssertion, GatewayError> {
        self.result
            .clone()
            .map_err(GatewayError::InvalidAssertion)
    }
}

/// A well-formed but unsigned SAML response for `subject`.
pub fn unsigned_response(
    sp: &ServiceProviderDescriptor,
    subject: &str,
    now: chrono::DateTime<chrono::Utc>,
) -> String {
    let issued = now.format("%Y-%m-%dT%H:%M:%SZ");
    let expires = (now + chrono::Duration::minutes(5)).format("%Y-%m-%dT%H:%M:%SZ");
    format!(
        r#"<samlp:Response xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="_resp1" Version="2.0" IssueInstant="{issued}" Destination="{acs}">
  <saml:Issuer>okta</saml:Issuer>
  <samlp:Status><samlp:StatusCode Value="urn:oasis:names:tc:SAML:2.0:status:Success"/></samlp:Status>
  <saml:Assertion ID="_assert1" Version="2.0" IssueInstant="{issued}">
    <saml:Issuer>okta</saml:Issuer>
    <saml:Subject>
      <saml:NameID Format="urn:oasis:names:tc:SAML:1.1:nameid-format:emailAddress">{subject}</saml:NameID>
      <saml:SubjectConfirmation Method="urn:oasis:names:tc:SAML:2.0:cm:bearer">
        <saml:SubjectConfirmationData NotOnOrAfter="{expires}" Recipient="{acs}"/>
      </saml:SubjectConfirmation>
    </saml:Subject>
    <saml:Conditions NotBefore="{issued}" NotOnOrAfter="{expires}">
      <saml:AudienceRestriction><saml:Audience>{entity}</saml:Audience></saml:AudienceRestriction>
    </saml:Conditions>
    <saml:AuthnStatement AuthnInstant="{issued}" SessionIndex="_session-1">
      <saml:AuthnContext><saml:AuthnContextClassRef>urn:oasis:names:tc:SAML:2.0:ac:classes:Password</saml:AuthnContextClassRef></saml:AuthnContext>
    </saml:AuthnStatement>
  </saml:Assertion>
</samlp:Response>"#,
        acs = sp.acs_url,
        entity = sp.entity_id,
    )
}

/// Enveloped signature template over the whole response (`ID="_resp1"`).
#[cfg(feature = "xmlsec")]
const RESPONSE_SIGNATURE_TEMPLATE: &str = r##"<ds:Signature xmlns:ds="http://www.w3.org/2000/09/xmldsig#"><ds:SignedInfo><ds:CanonicalizationMethod Algorithm="http://www.w3.org/2001/10/xml-exc-c14n#"/><ds:SignatureMethod Algorithm="http://www.w3.org/2001/04/xmldsig-more#rsa-sha256"/><ds:Reference URI="#_resp1"><ds:Transforms><ds:Transform Algorithm="http://www.w3.org/2000/09/xmldsig#enveloped-signature"/><ds:Transform Algorithm="http://www.w3.org/2001/10/xml-exc-c14n#"/></ds:Transforms><ds:DigestMethod Algorithm="http://www.w3.org/2001/04/xmlenc#sha256"/><ds:DigestValue></ds:DigestValue></ds:Reference></ds:SignedInfo><ds:SignatureValue></ds:SignatureValue></ds:Signature>"##;

/// [`unsigned_response`] signed with the test IdP's private key.
#[cfg(feature = "xmlsec")]
pub fn signed_response(
    sp: &ServiceProviderDescriptor,
    subject: &str,
    now: chrono::DateTime<chrono::Utc>,
) -> String {
    use openssl::pkey::PKey;

    // The signature belongs right after the response's Issuer.
    let unsigned = unsigned_response(sp, subject, now).replacen(
        "</saml:Issuer>",
        &format!("</saml:Issuer>{RESPONSE_SIGNATURE_TEMPLATE}"),
        1,
    );
    let key_der = PKey::private_key_from_pem(idp_credentials().1.as_bytes())
        .unwrap()
        .private_key_to_der()
        .unwrap();
    samael::crypto::sign_xml(unsigned, &key_der).unwrap()
}

/// A fresh, migrated SQLite database in a temporary directory.
#[cfg(feature = "database-sqlite")]
pub async fn migrated_sqlite() -> (tempfile::TempDir, DatabaseConfig) {
    let dir = tempfile::tempdir().unwrap();
    let database = DatabaseConfig::Sqlite(SqliteConfig {
        path: dir
            .path()
            .join("legacy.db")
            .to_string_lossy()
            .into_owned(),
        create_if_missing: true,
        busy_timeout_ms: 5000,
        statement_timeout_secs: 10,
    });
    run_migrations(&database).await.unwrap();
    (dir, database)
}

/// A complete gateway setup on disk: credential files, a migrated SQLite
/// database and a configuration pointing at both.
///
/// The one service is `sso`, with application `acme` and identity provider
/// `okta`, matching the cookie and ACS scenarios used across the tests.
#[cfg(feature = "database-sqlite")]
pub struct TestEnv {
    _dir: tempfile::TempDir,
    pub config: Arc<GatewayConfig>,
}

#[cfg(feature = "database-sqlite")]
impl TestEnv {
    pub async fn new() -> Self {
        Self::configure(|_| {}).await
    }

    /// Build the environment, letting the caller adjust the parsed config.
    pub async fn configure(adjust: impl FnOnce(&mut GatewayConfig)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let (sp_cert, sp_key) = sp_credentials();
        let (idp_cert, _) = idp_credentials();
        let sp_cert_path = write_file(dir.path(), "sp.crt", sp_cert);
        let sp_key_path = write_file(dir.path(), "sp.key", sp_key);
        let idp_cert_path = write_file(dir.path(), "okta.crt", idp_cert);
        let db_path = dir.path().join("legacy.db");

        let toml = format!(
            r#"
[server]
debug = false

[database]
type = "sqlite"
path = "{db}"
create_if_missing = true

[cookie]
secure = true
timeout_minutes = 5

[services.sso]
base_path = "/sso"
title = "Acme SSO"
entity_id = "https://gateway.example.com/sso"
private_key_path = "{sp_key}"
certificate_path = "{sp_cert}"

[apps.acme]
cookie_domain = ".acme.test"
cookie_path = "/"
local_client_url = "https://acme.test/home"

[apps.intranet]

[idps.okta]
login_url = "https://idp.example.com/sso/saml"
certificate_paths = ["{idp_cert}"]
"#,
            db = db_path.display(),
            sp_key = sp_key_path.display(),
            sp_cert = sp_cert_path.display(),
            idp_cert = idp_cert_path.display(),
        );

        let mut config = GatewayConfig::from_str(&toml).unwrap();
        adjust(&mut config);
        run_migrations(&config.database).await.unwrap();

        Self {
            _dir: dir,
            config: Arc::new(config),
        }
    }

    pub fn store(&self) -> SqlSessionStore {
        SqlSessionStore::new(&self.config.database).unwrap()
    }

    pub fn services(&self, verifier: impl AssertionVerifier + 'static) -> UnitServices {
        UnitServices {
            session_store: Arc::new(self.store()),
            verifier: Arc::new(verifier),
        }
    }

    /// A bodiless request for `service`.
    pub fn request(&self, service: &str, query: Option<&str>) -> RequestDescriptor {
        RequestDescriptor {
            request_id: Uuid::new_v4(),
            settings: self.config.clone(),
            service: service.to_string(),
            debug: self.config.server.debug,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            query: query.map(str::to_string),
        }
    }
}
