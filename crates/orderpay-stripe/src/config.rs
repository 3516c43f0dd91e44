//! # Stripe Configuration
//!
//! Keys, endpoint and timing for the Stripe adapter, read from the
//! environment. `Debug` never prints the secret key or webhook secret.

use orderpay_core::EngineError;
use std::env;
use std::time::Duration;

const DEFAULT_API_BASE_URL: &str = "https://api.stripe.com";
const DEFAULT_API_VERSION: &str = "2024-12-18.acacia";

/// Stripe API configuration
#[derive(Clone)]
pub struct StripeConfig {
    /// Secret API key (sk_test_... or sk_live_...)
    pub secret_key: String,

    /// Publishable key (pk_test_... or pk_live_...)
    pub publishable_key: String,

    /// Webhook signing secret (whsec_...)
    pub webhook_secret: String,

    /// API base URL (for testing/mocking)
    pub api_base_url: String,

    /// API version
    pub api_version: String,

    /// Per-request HTTP timeout
    pub request_timeout: Duration,

    /// Accepted clock skew for webhook timestamps, in seconds
    pub webhook_tolerance_secs: i64,
}

impl std::fmt::Debug for StripeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripeConfig")
            .field("publishable_key", &self.publishable_key)
            .field("api_base_url", &self.api_base_url)
            .field("api_version", &self.api_version)
            .field("live", &self.is_live_mode())
            .finish_non_exhaustive()
    }
}

impl StripeConfig {
    /// Load configuration from environment variables.
    ///
    /// Required env vars:
    /// - `STRIPE_SECRET_KEY`
    /// - `STRIPE_PUBLISHABLE_KEY`
    /// - `STRIPE_WEBHOOK_SECRET`
    ///
    /// Optional: `STRIPE_API_BASE_URL`
    pub fn from_env() -> Result<Self, EngineError> {
        dotenvy::dotenv().ok();

        let config = Self::new(
            required("STRIPE_SECRET_KEY")?,
            required("STRIPE_PUBLISHABLE_KEY")?,
            required("STRIPE_WEBHOOK_SECRET")?,
        );
        config.validate()?;

        Ok(match env::var("STRIPE_API_BASE_URL") {
            Ok(url) => config.with_api_base_url(url),
            Err(_) => config,
        })
    }

    /// Create config with explicit values (for testing)
    pub fn new(
        secret_key: impl Into<String>,
        publishable_key: impl Into<String>,
        webhook_secret: impl Into<String>,
    ) -> Self {
        Self {
            secret_key: secret_key.into(),
            publishable_key: publishable_key.into(),
            webhook_secret: webhook_secret.into(),
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            api_version: DEFAULT_API_VERSION.to_string(),
            request_timeout: Duration::from_secs(30),
            webhook_tolerance_secs: 300,
        }
    }

    /// Reject keys that do not carry Stripe's prefixes
    pub fn validate(&self) -> Result<(), EngineError> {
        let checks: [(&str, &str, &[&str]); 3] = [
            ("STRIPE_SECRET_KEY", self.secret_key.as_str(), &["sk_test_", "sk_live_"][..]),
            ("STRIPE_PUBLISHABLE_KEY", self.publishable_key.as_str(), &["pk_test_", "pk_live_"][..]),
            ("STRIPE_WEBHOOK_SECRET", self.webhook_secret.as_str(), &["whsec_"][..]),
        ];

        for (name, value, prefixes) in checks {
            if !prefixes.iter().any(|p| value.starts_with(p)) {
                return Err(EngineError::Configuration(format!(
                    "{} must start with {}",
                    name,
                    prefixes.join(" or ")
                )));
            }
        }
        Ok(())
    }

    pub fn is_test_mode(&self) -> bool {
        self.secret_key.starts_with("sk_test_")
    }

    pub fn is_live_mode(&self) -> bool {
        self.secret_key.starts_with("sk_live_")
    }

    /// `Authorization` header value
    pub fn auth_header(&self) -> String {
        format!("Bearer {}", self.secret_key)
    }

    /// Builder: set custom API base URL (for testing)
    pub fn with_api_base_url(mut self, url: impl Into<String>) -> Self {
        self.api_base_url = url.into();
        self
    }

    /// Builder: set the per-request timeout
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

fn required(name: &str) -> Result<String, EngineError> {
    env::var(name).map_err(|_| EngineError::Configuration(format!("{} not set", name)))
}
