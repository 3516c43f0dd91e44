//! # Engine Configuration
//!
//! Timeouts and policies for the transaction engine, loaded from the
//! environment.

use orderpay_core::EngineError;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Engine tuning and policy knobs
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Budget for every outbound provider call
    pub provider_timeout: Duration,

    /// How long a reservation holds stock before the sweep returns it
    pub reservation_ttl: Duration,

    /// Put refunded items back into stock once a payment is fully refunded
    pub restock_on_refund: bool,

    /// Upper bound on distinct lines in a cart
    pub max_cart_lines: usize,

    /// Attempts at a versioned write before giving up with `Conflict`
    pub max_transition_retries: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            provider_timeout: Duration::from_secs(30),
            reservation_ttl: Duration::from_secs(900),
            restock_on_refund: true,
            max_cart_lines: 100,
            max_transition_retries: 5,
        }
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> Result<T, EngineError> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| EngineError::Configuration(format!("{} has an invalid value: {}", name, raw))),
        Err(_) => Ok(default),
    }
}

impl EngineConfig {
    /// Load from environment variables, falling back to defaults.
    ///
    /// - `PROVIDER_TIMEOUT_SECS` (30)
    /// - `RESERVATION_TTL_SECS` (900)
    /// - `RESTOCK_ON_REFUND` (true)
    /// - `MAX_CART_LINES` (100)
    /// - `MAX_TRANSITION_RETRIES` (5)
    pub fn from_env() -> Result<Self, EngineError> {
        dotenvy::dotenv().ok();

        let defaults = Self::default();
        let config = Self {
            provider_timeout: Duration::from_secs(env_or(
                "PROVIDER_TIMEOUT_SECS",
                defaults.provider_timeout.as_secs(),
            )?),
            reservation_ttl: Duration::from_secs(env_or(
                "RESERVATION_TTL_SECS",
                defaults.reservation_ttl.as_secs(),
            )?),
            restock_on_refund: env_or("RESTOCK_ON_REFUND", defaults.restock_on_refund)?,
            max_cart_lines: env_or("MAX_CART_LINES", defaults.max_cart_lines)?,
            max_transition_retries: env_or(
                "MAX_TRANSITION_RETRIES",
                defaults.max_transition_retries,
            )?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.provider_timeout.is_zero() {
            return Err(EngineError::Configuration(
                "PROVIDER_TIMEOUT_SECS must be positive".to_string(),
            ));
        }

        // A reservation must outlive the provider call that depends on it
        if self.reservation_ttl < self.provider_timeout {
            return Err(EngineError::Configuration(
                "RESERVATION_TTL_SECS must be at least PROVIDER_TIMEOUT_SECS".to_string(),
            ));
        }

        if self.max_cart_lines == 0 {
            return Err(EngineError::Configuration(
                "MAX_CART_LINES must be positive".to_string(),
            ));
        }

        Ok(())
    }

    pub fn with_provider_timeout(mut self, timeout: Duration) -> Self {
        self.provider_timeout = timeout;
        self
    }

    pub fn with_reservation_ttl(mut self, ttl: Duration) -> Self {
        self.reservation_ttl = ttl;
        self
    }

    pub fn with_restock_on_refund(mut self, restock: bool) -> Self {
        self.restock_on_refund = restock;
        self
    }

    pub fn with_max_cart_lines(mut self, lines: usize) -> Self {
        self.max_cart_lines = lines;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.restock_on_refund);
        assert_eq!(config.provider_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_ttl_shorter_than_timeout_rejected() {
        let config = EngineConfig::default()
            .with_provider_timeout(Duration::from_secs(60))
            .with_reservation_ttl(Duration::from_secs(10));
        assert!(matches!(
            config.validate(),
            Err(EngineError::Configuration(_))
        ));
    }

    #[test]
    fn test_zero_cart_lines_rejected() {
        let config = EngineConfig::default().with_max_cart_lines(0);
        assert!(config.validate().is_err());
    }
}
