use std::fmt;

/// This gateway's own SAML identity for one service.
///
/// Built once per execution unit from the service configuration and the
/// credential files; never mutated afterwards.
#[derive(Clone)]
pub struct ServiceProviderDescriptor {
    pub entity_id: String,
    pub acs_url: String,
    /// PEM encoded private key. Never logged.
    pub private_key: String,
    /// PEM encoded certificate matching `private_key`.
    pub certificate: String,
    pub allow_unencrypted_assertion: bool,
}

impl fmt::Debug for ServiceProviderDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceProviderDescriptor")
            .field("entity_id", &self.entity_id)
            .field("acs_url", &self.acs_url)
            .field("private_key", &"[REDACTED]")
            .field("certificate", &format_args!("{} bytes", self.certificate.len()))
            .field(
                "allow_unencrypted_assertion",
                &self.allow_unencrypted_assertion,
            )
            .finish()
    }
}

/// One trusted identity provider.
#[derive(Debug, Clone)]
pub struct IdentityProviderDescriptor {
    pub name: String,
    pub login_url: String,
    pub logout_url: Option<String>,
    /// PEM certificates, in configuration order. A response signed by any
    /// one of them is accepted.
    pub trusted_certificates: Vec<String>,
}
