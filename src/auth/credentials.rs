//! Reads PEM key material from disk into descriptor fields.
//!
//! Files are read on every request. Rotating a certificate on disk takes
//! effect on the next login without a restart.

use std::{fmt, path::Path};

use openssl::{pkey::PKey, x509::X509};

use super::{IdentityProviderDescriptor, ServiceProviderDescriptor};
use crate::{
    config::{IdpConfig, ServiceConfig},
    error::GatewayError,
};

const GENERIC_MESSAGE: &str = "Unable to load service credentials";

/// Descriptor field a file is loaded into. Decides how the PEM is parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialField {
    PrivateKey,
    Certificate,
    TrustedCertificates,
}

impl fmt::Display for CredentialField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CredentialField::PrivateKey => "private key",
            CredentialField::Certificate => "certificate",
            CredentialField::TrustedCertificates => "trusted certificate",
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CredentialLoader {
    verbose: bool,
}

impl CredentialLoader {
    /// `verbose` keeps filesystem and parse errors in the returned error;
    /// otherwise they are replaced by a generic message.
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }

    /// Read one PEM file and check that it parses as `field`.
    pub async fn read_single(
        &self,
        path: impl AsRef<Path>,
        field: CredentialField,
    ) -> Result<String, GatewayError> {
        let path = path.as_ref();
        let pem = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| self.unreadable(field, path, &e))?;

        let parsed = match field {
            CredentialField::PrivateKey => PKey::private_key_from_pem(pem.as_bytes()).map(drop),
            CredentialField::Certificate | CredentialField::TrustedCertificates => {
                X509::from_pem(pem.as_bytes()).map(drop)
            }
        };
        parsed.map_err(|e| self.unreadable(field, path, &e))?;

        Ok(pem)
    }

    /// Read a list of PEM files, preserving order.
    pub async fn read_list<P: AsRef<Path>>(
        &self,
        paths: &[P],
        field: CredentialField,
    ) -> Result<Vec<String>, GatewayError> {
        let mut values = Vec::with_capacity(paths.len());
        for path in paths {
            values.push(self.read_single(path, field).await?);
        }
        Ok(values)
    }

    /// Build the service provider descriptor for a configured service.
    pub async fn load_service_provider(
        &self,
        service: &ServiceConfig,
    ) -> Result<ServiceProviderDescriptor, GatewayError> {
        let private_key = self
            .read_single(&service.private_key_path, CredentialField::PrivateKey)
            .await?;
        let certificate = self
            .read_single(&service.certificate_path, CredentialField::Certificate)
            .await?;

        Ok(ServiceProviderDescriptor {
            entity_id: service.entity_id.clone(),
            acs_url: service.acs_url(),
            private_key,
            certificate,
            allow_unencrypted_assertion: service.allow_unencrypted_assertion,
        })
    }

    /// Build the descriptor for a configured identity provider.
    pub async fn load_identity_provider(
        &self,
        name: &str,
        idp: &IdpConfig,
    ) -> Result<IdentityProviderDescriptor, GatewayError> {
        let trusted_certificates = self
            .read_list(&idp.certificate_paths, CredentialField::TrustedCertificates)
            .await?;

        Ok(IdentityProviderDescriptor {
            name: name.to_string(),
            login_url: idp.login_url.clone(),
            logout_url: idp.logout_url.clone(),
            trusted_certificates,
        })
    }

    fn unreadable(
        &self,
        field: CredentialField,
        path: &Path,
        error: &dyn fmt::Display,
    ) -> GatewayError {
        let message = format!("Failed to load {} from {}: {}", field, path.display(), error);
        tracing::warn!(%field, path = %path.display(), error = %error, "Credential unreadable");
        if self.verbose {
            GatewayError::CredentialUnreadable(message)
        } else {
            GatewayError::CredentialUnreadable(GENERIC_MESSAGE.to_string())
        }
    }
}
