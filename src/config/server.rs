use std::{net::IpAddr, time::Duration};

use serde::{Deserialize, Serialize};

use super::ConfigError;

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Host address to bind to.
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Title used for services that do not set their own.
    #[serde(default = "default_title")]
    pub title: String,

    /// Verbose mode. Error responses carry the real error instead of a
    /// generic message. Never enable in production.
    #[serde(default)]
    pub debug: bool,

    /// Request body size limit in bytes. SAML responses are small; the
    /// default leaves room for large signed and encrypted assertions.
    #[serde(default = "default_body_limit")]
    pub body_limit_bytes: usize,

    /// Deadline for one execution unit, from spawn to reply.
    #[serde(default = "default_dispatch_timeout")]
    pub dispatch_timeout_secs: u64,

    /// How long to wait for in-flight units on shutdown.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            title: default_title(),
            debug: false,
            body_limit_bytes: default_body_limit(),
            dispatch_timeout_secs: default_dispatch_timeout(),
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

impl ServerConfig {
    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_secs(self.dispatch_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub(super) fn validate(&self) -> Result<(), ConfigError> {
        if self.dispatch_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "server.dispatch_timeout_secs must be greater than zero".into(),
            ));
        }
        if self.body_limit_bytes == 0 {
            return Err(ConfigError::Validation(
                "server.body_limit_bytes must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

fn default_host() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}

fn default_port() -> u16 {
    8080
}

fn default_title() -> String {
    "Gatehouse".to_string()
}

fn default_body_limit() -> usize {
    1024 * 1024 // 1 MB
}

fn default_dispatch_timeout() -> u64 {
    30
}

fn default_shutdown_timeout() -> u64 {
    30
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.dispatch_timeout(), Duration::from_secs(30));
        assert!(!config.debug);
    }

    #[test]
    fn test_zero_dispatch_timeout_rejected() {
        let config: ServerConfig = toml::from_str("dispatch_timeout_secs = 0").unwrap();
        assert!(config.validate().is_err());
    }
}
