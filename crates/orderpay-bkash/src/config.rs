//! # bKash Configuration
//!
//! Merchant credentials for the bKash checkout API, loaded from the
//! environment.

use orderpay_core::EngineError;
use std::env;
use std::time::Duration;

const DEFAULT_BASE_URL: &str = "https://checkout.sandbox.bka.sh/v1.2.0-beta";

/// bKash merchant configuration
#[derive(Clone)]
pub struct BkashConfig {
    pub app_key: String,

    pub app_secret: String,

    /// Merchant username for the token grant
    pub username: String,

    /// Merchant password for the token grant
    pub password: String,

    /// API base URL (sandbox by default)
    pub base_url: String,

    /// Shared secret used to sign webhook notifications
    pub webhook_secret: String,

    pub request_timeout: Duration,
}

impl std::fmt::Debug for BkashConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BkashConfig")
            .field("app_key", &self.app_key)
            .field("username", &self.username)
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

fn required(name: &str) -> Result<String, EngineError> {
    env::var(name).map_err(|_| EngineError::Configuration(format!("{} not set", name)))
}

impl BkashConfig {
    /// Load configuration from environment variables.
    ///
    /// Required env vars:
    /// - `BKASH_APP_KEY`
    /// - `BKASH_APP_SECRET`
    /// - `BKASH_USERNAME`
    /// - `BKASH_PASSWORD`
    /// - `BKASH_WEBHOOK_SECRET`
    ///
    /// Optional: `BKASH_BASE_URL`
    pub fn from_env() -> Result<Self, EngineError> {
        dotenvy::dotenv().ok();

        let config = Self::new(
            required("BKASH_APP_KEY")?,
            required("BKASH_APP_SECRET")?,
            required("BKASH_USERNAME")?,
            required("BKASH_PASSWORD")?,
            required("BKASH_WEBHOOK_SECRET")?,
        );

        Ok(match env::var("BKASH_BASE_URL") {
            Ok(url) => config.with_base_url(url),
            Err(_) => config,
        })
    }

    pub fn new(
        app_key: impl Into<String>,
        app_secret: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
        webhook_secret: impl Into<String>,
    ) -> Self {
        Self {
            app_key: app_key.into(),
            app_secret: app_secret.into(),
            username: username.into(),
            password: password.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            webhook_secret: webhook_secret.into(),
            request_timeout: Duration::from_secs(30),
        }
    }

    pub fn is_sandbox(&self) -> bool {
        self.base_url.contains("sandbox")
    }

    /// Builder: set custom API base URL (for testing)
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_to_sandbox() {
        let config = BkashConfig::new("key", "secret", "merchant", "pass", "hook");
        assert!(config.is_sandbox());

        let config = config.with_base_url("https://checkout.pay.bka.sh/v1.2.0-beta/");
        assert!(!config.is_sandbox());
        assert!(!config.base_url.ends_with('/'));
    }

    #[test]
    fn test_debug_hides_credentials() {
        let config = BkashConfig::new("key", "app-secret-1", "merchant", "hunter2", "hook-secret");
        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("app-secret-1"));
        assert!(!rendered.contains("hunter2"));
        assert!(!rendered.contains("hook-secret"));
    }
}
