//! Tunnel configuration

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Default public broker endpoint.
pub const DEFAULT_BROKER_URL: &str = "https://localrun.stream";

/// Default per-request timeout against the origin.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(15_000);

/// Default retry budget per forwarded request.
pub const DEFAULT_MAX_RETRIES: u32 = 2;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Origin port must be a positive integer")]
    InvalidPort,

    #[error("Invalid subdomain '{0}': must be exactly 10 alphanumeric characters")]
    InvalidSubdomain(String),
}

/// TLS options for dialling the local origin.
#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    /// Dial the origin over https.
    pub use_tls: bool,
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
    pub ca_path: Option<PathBuf>,
    /// Skip certificate verification entirely.
    pub allow_invalid_cert: bool,
}

/// Immutable tunnel configuration. Build one with [`TunnelConfig::builder`].
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Origin port (required).
    pub port: u16,
    /// Origin host.
    pub local_host: String,
    /// Broker base URL.
    pub broker_url: String,
    /// Requested subdomain; broker assigns one when absent.
    pub subdomain: Option<String>,
    pub tls: TlsOptions,
    /// Base timeout for forwarded requests; the forwarder adapts it per
    /// request shape.
    pub request_timeout: Duration,
    /// Retries per request on top of the initial attempt.
    pub max_retries: u32,
}

impl TunnelConfig {
    pub fn builder(port: u16) -> TunnelConfigBuilder {
        TunnelConfigBuilder::new(port)
    }

    /// Base URL of the origin this tunnel forwards to.
    pub fn origin_base(&self) -> String {
        let scheme = if self.tls.use_tls { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.local_host, self.port)
    }

    /// `host:port` of the origin, for diagnostics and error headers.
    pub fn origin_authority(&self) -> String {
        format!("{}:{}", self.local_host, self.port)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::InvalidPort);
        }
        if let Some(subdomain) = &self.subdomain {
            if !is_valid_subdomain(subdomain) {
                return Err(ConfigError::InvalidSubdomain(subdomain.clone()));
            }
        }
        Ok(())
    }
}

/// A requested subdomain is accepted iff it is exactly 10 ASCII
/// alphanumeric characters.
pub fn is_valid_subdomain(subdomain: &str) -> bool {
    subdomain.len() == 10 && subdomain.chars().all(|c| c.is_ascii_alphanumeric())
}

/// Builder for [`TunnelConfig`]
pub struct TunnelConfigBuilder {
    config: TunnelConfig,
}

impl TunnelConfigBuilder {
    fn new(port: u16) -> Self {
        Self {
            config: TunnelConfig {
                port,
                local_host: "localhost".to_string(),
                broker_url: DEFAULT_BROKER_URL.to_string(),
                subdomain: None,
                tls: TlsOptions::default(),
                request_timeout: DEFAULT_REQUEST_TIMEOUT,
                max_retries: DEFAULT_MAX_RETRIES,
            },
        }
    }

    pub fn local_host(mut self, host: impl Into<String>) -> Self {
        self.config.local_host = host.into();
        self
    }

    pub fn broker_url(mut self, url: impl Into<String>) -> Self {
        self.config.broker_url = url.into();
        self
    }

    pub fn subdomain(mut self, subdomain: impl Into<String>) -> Self {
        self.config.subdomain = Some(subdomain.into());
        self
    }

    pub fn tls(mut self, tls: TlsOptions) -> Self {
        self.config.tls = tls;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.config.max_retries = retries;
        self
    }

    pub fn build(self) -> Result<TunnelConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TunnelConfig::builder(3000).build().unwrap();

        assert_eq!(config.port, 3000);
        assert_eq!(config.local_host, "localhost");
        assert_eq!(config.broker_url, DEFAULT_BROKER_URL);
        assert_eq!(config.request_timeout, Duration::from_millis(15_000));
        assert_eq!(config.max_retries, 2);
        assert!(config.subdomain.is_none());
        assert!(!config.tls.use_tls);
    }

    #[test]
    fn test_origin_base_scheme_follows_tls() {
        let plain = TunnelConfig::builder(8080).build().unwrap();
        assert_eq!(plain.origin_base(), "http://localhost:8080");

        let tls = TunnelConfig::builder(8443)
            .tls(TlsOptions {
                use_tls: true,
                ..Default::default()
            })
            .build()
            .unwrap();
        assert_eq!(tls.origin_base(), "https://localhost:8443");
    }

    #[test]
    fn test_subdomain_rule() {
        assert!(is_valid_subdomain("abcde12345"));
        assert!(is_valid_subdomain("ABCDE12345"));

        assert!(!is_valid_subdomain("short"));
        assert!(!is_valid_subdomain("elevenchars"));
        assert!(!is_valid_subdomain("has-hyphen"));
        assert!(!is_valid_subdomain("has space1"));
        assert!(!is_valid_subdomain(""));
        assert!(!is_valid_subdomain("unicodé123"));
    }

    #[test]
    fn test_build_rejects_bad_subdomain() {
        let result = TunnelConfig::builder(3000).subdomain("nope").build();
        assert!(matches!(result, Err(ConfigError::InvalidSubdomain(_))));
    }

    #[test]
    fn test_build_rejects_zero_port() {
        let result = TunnelConfig::builder(0).build();
        assert!(matches!(result, Err(ConfigError::InvalidPort)));
    }
}
