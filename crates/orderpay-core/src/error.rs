//! # Engine Error Types
//!
//! Typed error handling for the orderpay transaction engine.
//! All engine operations return `Result<T, EngineError>`.

use crate::money::Amount;
use thiserror::Error;
use uuid::Uuid;

/// Core error type for all order and payment operations
#[derive(Debug, Error)]
pub enum EngineError {
    /// Bad input shape (empty cart, non-positive quantity, ...)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Product not found in catalog
    #[error("Product not found: {product_id}")]
    ProductNotFound { product_id: String },

    /// Product exists but is not in a purchasable status
    #[error("Product is not available for purchase: {product_id}")]
    ProductUnavailable { product_id: String },

    /// Not enough stock to reserve the requested quantity
    #[error("Insufficient stock for {product_id}: requested {requested}, available {available}")]
    InsufficientStock {
        product_id: String,
        requested: u32,
        available: u64,
    },

    /// Provider identifier does not map to a registered gateway
    #[error("Unsupported payment provider: {provider}")]
    UnsupportedProvider { provider: String },

    /// Payment provider API error (message redacted of secrets)
    #[error("Provider error [{provider}]: {message}")]
    Provider { provider: String, message: String },

    /// Network/HTTP error communicating with provider
    #[error("Network error: {0}")]
    Network(String),

    /// Outbound provider call exceeded its time budget
    #[error("Provider {provider} timed out after {timeout_ms}ms")]
    ProviderTimeout { provider: String, timeout_ms: u64 },

    /// Webhook signature verification failed
    #[error("Invalid webhook signature: {0}")]
    InvalidSignature(String),

    /// Webhook payload could not be parsed into a provider event
    #[error("Malformed webhook payload: {0}")]
    MalformedPayload(String),

    /// Webhook or status query referenced a transaction we never issued
    #[error("Unknown transaction: {transaction_id}")]
    UnknownTransaction { transaction_id: String },

    /// Payment is not in a refundable state
    #[error("Payment {payment_id} is not refundable in status {status}")]
    NotRefundable { payment_id: Uuid, status: String },

    /// Requested refund exceeds what is left to refund
    #[error("Refund of {requested} exceeds refundable amount {refundable}")]
    AmountExceedsCaptured { requested: Amount, refundable: Amount },

    /// Order cannot be cancelled from its current status
    #[error("Order {order_id} cannot be cancelled in status {status}")]
    NotCancellable { order_id: Uuid, status: String },

    #[error("Order not found: {order_id}")]
    OrderNotFound { order_id: Uuid },

    #[error("Payment not found: {payment_id}")]
    PaymentNotFound { payment_id: Uuid },

    /// Caller does not own the entity
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Optimistic version check failed (concurrent writer won)
    #[error("Concurrent modification of {entity} {id}")]
    Conflict { entity: &'static str, id: Uuid },

    /// Configuration errors (missing keys, invalid config)
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Internal error (should not happen)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Build a provider error with secrets scrubbed from the message.
    pub fn provider(provider: impl Into<String>, message: impl AsRef<str>) -> Self {
        EngineError::Provider {
            provider: provider.into(),
            message: redact_secrets(message.as_ref()),
        }
    }

    /// Returns true if this error is retryable by the caller
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::Network(_)
                | EngineError::ProviderTimeout { .. }
                | EngineError::Provider { .. }
                | EngineError::Conflict { .. }
        )
    }

    /// Provider-side failures that must run checkout compensation
    pub fn triggers_compensation(&self) -> bool {
        matches!(
            self,
            EngineError::Provider { .. }
                | EngineError::Network(_)
                | EngineError::ProviderTimeout { .. }
                | EngineError::Serialization(_)
        )
    }

    /// Webhook errors that are still acknowledged to stop provider redelivery
    pub fn is_acknowledgeable(&self) -> bool {
        matches!(self, EngineError::UnknownTransaction { .. })
    }

    /// Returns the HTTP status code appropriate for this error
    pub fn status_code(&self) -> u16 {
        match self {
            EngineError::Validation(_) => 400,
            EngineError::ProductNotFound { .. } => 404,
            EngineError::ProductUnavailable { .. } => 409,
            EngineError::InsufficientStock { .. } => 409,
            EngineError::UnsupportedProvider { .. } => 400,
            EngineError::Provider { .. } => 502,
            EngineError::Network(_) => 503,
            EngineError::ProviderTimeout { .. } => 504,
            EngineError::InvalidSignature(_) => 401,
            EngineError::MalformedPayload(_) => 400,
            EngineError::UnknownTransaction { .. } => 404,
            EngineError::NotRefundable { .. } => 409,
            EngineError::AmountExceedsCaptured { .. } => 422,
            EngineError::NotCancellable { .. } => 409,
            EngineError::OrderNotFound { .. } => 404,
            EngineError::PaymentNotFound { .. } => 404,
            EngineError::Forbidden(_) => 403,
            EngineError::Conflict { .. } => 409,
            EngineError::Configuration(_) => 500,
            EngineError::Serialization(_) => 500,
            EngineError::Internal(_) => 500,
        }
    }
}

/// Result type alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

const SECRET_PREFIXES: &[&str] = &["sk_live_", "sk_test_", "rk_live_", "rk_test_", "whsec_", "pi_secret_"];

/// Replace anything that looks like a credential with `[REDACTED]`.
///
/// Covers Stripe secret/restricted keys, webhook secrets, client secrets
/// (`..._secret_...`) and whatever follows a `Bearer` or `id_token` marker.
pub fn redact_secrets(message: &str) -> String {
    let mut out = Vec::new();
    let mut redact_next = false;

    for word in message.split(' ') {
        if redact_next && !word.is_empty() {
            out.push("[REDACTED]".to_string());
            redact_next = false;
            continue;
        }

        let bare = word.trim_matches(|c: char| c == '"' || c == '\'' || c == ',' || c == ':');
        let lower = bare.to_ascii_lowercase();

        if lower == "bearer" || lower == "id_token" || lower == "authorization" {
            redact_next = true;
            out.push(word.to_string());
        } else if SECRET_PREFIXES.iter().any(|p| bare.starts_with(p)) || bare.contains("_secret_") {
            out.push(word.replace(bare, "[REDACTED]"));
        } else {
            out.push(word.to_string());
        }
    }

    out.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(EngineError::Network("timeout".into()).is_retryable());
        assert!(EngineError::ProviderTimeout {
            provider: "stripe".into(),
            timeout_ms: 30_000
        }
        .is_retryable());
        assert!(!EngineError::Validation("bad data".into()).is_retryable());
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(EngineError::Validation("test".into()).status_code(), 400);
        assert_eq!(
            EngineError::ProductNotFound {
                product_id: "x".into()
            }
            .status_code(),
            404
        );
        assert_eq!(EngineError::InvalidSignature("bad".into()).status_code(), 401);
        assert_eq!(
            EngineError::AmountExceedsCaptured {
                requested: Amount::from_minor(200),
                refundable: Amount::from_minor(100),
            }
            .status_code(),
            422
        );
    }

    #[test]
    fn test_unknown_transaction_is_acknowledged() {
        let err = EngineError::UnknownTransaction {
            transaction_id: "pi_123".into(),
        };
        assert!(err.is_acknowledgeable());
        assert!(!EngineError::InvalidSignature("x".into()).is_acknowledgeable());
    }

    #[test]
    fn test_provider_error_is_redacted() {
        let err = EngineError::provider(
            "stripe",
            "Invalid API Key provided: sk_live_abc123 with Bearer tok_999",
        );
        let text = err.to_string();
        assert!(!text.contains("sk_live_abc123"));
        assert!(!text.contains("tok_999"));
        assert!(text.contains("[REDACTED]"));
        assert!(text.contains("Invalid API Key provided"));
    }

    #[test]
    fn test_client_secret_is_redacted() {
        let redacted = redact_secrets("secret pi_3Mt_secret_YrKJUK was rejected");
        assert_eq!(redacted, "secret [REDACTED] was rejected");
    }
}
