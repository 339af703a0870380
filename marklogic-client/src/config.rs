use std::time::Duration;

use serde::Deserialize;

use crate::retry::RetryConfig;
use crate::{Error, Result};

const DEFAULT_PORT: u16 = 8000;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    #[default]
    Http,
    Https,
}

impl Scheme {
    fn as_str(self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

/// Basic authentication credentials. The app server has to be configured for `basic` or
/// `digestbasic` authentication.
#[derive(Clone, PartialEq, Deserialize)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for BasicAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:****", self.username)
    }
}

/// Connection settings for a MarkLogic REST app server.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub scheme: Scheme,
    /// Content database, the app server's default database is used when absent.
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub auth: Option<BasicAuth>,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_request_timeout_ms() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_MS
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
            scheme: Scheme::Http,
            database: None,
            auth: None,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            retry: RetryConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(Error::InvalidConfig("host can not be empty".to_string()));
        }
        if self.port == 0 {
            return Err(Error::InvalidConfig("port must be greater than 0".to_string()));
        }
        if self.request_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "requestTimeoutMs must be greater than 0".to_string(),
            ));
        }
        if let Some(auth) = &self.auth
            && auth.username.is_empty()
        {
            return Err(Error::InvalidConfig(
                "username can not be empty when auth is set".to_string(),
            ));
        }
        self.retry.validate()
    }

    /// `scheme://host:port`, without a trailing slash.
    pub fn base_url(&self) -> String {
        format!("{}://{}:{}", self.scheme.as_str(), self.host, self.port)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_with_defaults() {
        let config: ClientConfig = serde_json::from_str(r#"{"host": "ml.local"}"#).unwrap();
        assert_eq!(config.host, "ml.local");
        assert_eq!(config.port, 8000);
        assert_eq!(config.scheme, Scheme::Http);
        assert_eq!(config.base_url(), "http://ml.local:8000");
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_deserialize_full() {
        let config: ClientConfig = serde_json::from_str(
            r#"{
                "host": "ml.local",
                "port": 8011,
                "scheme": "https",
                "database": "Documents",
                "auth": {"username": "admin", "password": "secret"},
                "requestTimeoutMs": 500,
                "retry": {"maxRetries": 2}
            }"#,
        )
        .unwrap();
        assert_eq!(config.base_url(), "https://ml.local:8011");
        assert_eq!(config.database.as_deref(), Some("Documents"));
        assert_eq!(config.retry.max_retries, 2);
        assert_eq!(format!("{:?}", config.auth.unwrap()), "admin:****");
    }

    #[test]
    fn test_validation_failures() {
        let config = ClientConfig {
            host: " ".to_string(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

        let config = ClientConfig {
            request_timeout_ms: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

        let config = ClientConfig {
            auth: Some(BasicAuth {
                username: "".to_string(),
                password: "x".to_string(),
            }),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }
}
