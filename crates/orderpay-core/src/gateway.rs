//! # Payment Gateway Trait
//!
//! Capability interface every payment provider adapter implements, plus the
//! lookup table that maps a provider identifier to its adapter.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   PaymentGateway (trait)                    │
//! │  ├── create_payment()                                       │
//! │  ├── confirm_payment()                                      │
//! │  ├── get_status()                                           │
//! │  ├── refund()                                               │
//! │  └── verify_webhook()                                       │
//! └─────────────────────────────────────────────────────────────┘
//!                            ▲
//!                 ┌──────────┴──────────┐
//!         ┌───────┴───────┐     ┌───────┴───────┐
//!         │ StripeGateway │     │ BkashGateway  │
//!         └───────────────┘     └───────────────┘
//! ```
//!
//! The set of providers is closed (`ProviderKind`); selection is a pure
//! table lookup keyed by that enum.

use crate::error::{EngineError, EngineResult};
use crate::money::{Amount, Currency};
use crate::order::Order;
use crate::payment::{PaymentStatus, ProviderKind};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// What the client needs to finish paying out-of-band
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum Continuation {
    /// Client secret for an in-page confirmation (Stripe-like)
    ClientSecret(String),
    /// Hosted page to redirect the buyer to (bKash-like)
    RedirectUrl(String),
}

/// Result of creating a payment with a provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderHandle {
    /// Provider transaction id to persist on the payment
    pub transaction_id: String,

    pub continuation: Continuation,

    /// Provider status at creation, normalized. A settled status here is
    /// applied right away, without waiting for a webhook.
    pub status: PaymentStatus,

    #[serde(default)]
    pub raw_response: serde_json::Value,
}

/// Normalized result of a confirm or status query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentResult {
    pub transaction_id: String,

    pub status: PaymentStatus,

    /// Provider's status string before normalization
    pub provider_status: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<Amount>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub currency: Option<Currency>,

    #[serde(default)]
    pub raw_response: serde_json::Value,
}

/// Result of a refund call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRefund {
    pub refund_id: String,

    /// Provider refund status string (e.g., "succeeded", "Completed")
    pub status: String,

    pub amount: Amount,

    #[serde(default)]
    pub raw_response: serde_json::Value,
}

/// Outcome carried by a webhook event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventOutcome {
    Succeeded,
    Failed,
    /// Anything the engine does not act on (passthrough of the provider type)
    Other(String),
}

/// A verified, normalized webhook event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderEvent {
    /// Event id from provider
    pub event_id: String,

    pub provider: ProviderKind,

    /// Idempotency key for reconciliation; absent on events that do not
    /// reference a payment (customer or payment-method events)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,

    pub outcome: EventOutcome,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<Amount>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,

    /// Raw event data (for audit)
    #[serde(default)]
    pub provider_metadata: serde_json::Value,

    pub occurred_at: DateTime<Utc>,
}

/// Core trait for payment provider adapters.
///
/// Each provider implements the same capability set so the engine can
/// route by `ProviderKind` without knowing wire details.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Which provider this adapter talks to
    fn provider(&self) -> ProviderKind;

    /// HTTP header that carries the webhook signature
    fn signature_header(&self) -> &'static str;

    /// Create a payment for `order` and return the client continuation.
    async fn create_payment(
        &self,
        order: &Order,
        amount: Amount,
        currency: Currency,
    ) -> EngineResult<ProviderHandle>;

    /// Explicit execute step after buyer action.
    async fn confirm_payment(
        &self,
        transaction_id: &str,
        confirmation_token: Option<&str>,
    ) -> EngineResult<PaymentResult>;

    /// On-demand status query.
    async fn get_status(&self, transaction_id: &str) -> EngineResult<PaymentResult>;

    /// Refund `amount` of a settled payment.
    async fn refund(
        &self,
        transaction_id: &str,
        amount: Amount,
        currency: Currency,
        reason: Option<&str>,
    ) -> EngineResult<ProviderRefund>;

    /// Verify a webhook signature and parse the event.
    ///
    /// Must fail with `InvalidSignature` before looking at the payload
    /// contents, and with `MalformedPayload` when the verified body cannot
    /// be normalized.
    async fn verify_webhook(&self, payload: &[u8], signature: &str) -> EngineResult<ProviderEvent>;
}

/// Type alias for a shared gateway (dynamic dispatch)
pub type SharedGateway = Arc<dyn PaymentGateway>;

/// Lookup table from provider kind to adapter
#[derive(Clone, Default)]
pub struct GatewayRegistry {
    gateways: HashMap<ProviderKind, SharedGateway>,
}

impl GatewayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a gateway under its own provider kind
    pub fn register(&mut self, gateway: SharedGateway) {
        self.gateways.insert(gateway.provider(), gateway);
    }

    /// Register with builder pattern
    pub fn with_gateway(mut self, gateway: SharedGateway) -> Self {
        self.register(gateway);
        self
    }

    /// Map an identifier string to a registered gateway.
    ///
    /// Unknown or unregistered providers fail with `UnsupportedProvider`.
    pub fn resolve(&self, provider: &str) -> EngineResult<SharedGateway> {
        let kind: ProviderKind = provider.parse()?;
        self.get(kind)
    }

    pub fn get(&self, kind: ProviderKind) -> EngineResult<SharedGateway> {
        self.gateways
            .get(&kind)
            .cloned()
            .ok_or_else(|| EngineError::UnsupportedProvider {
                provider: kind.to_string(),
            })
    }

    /// List all registered providers
    pub fn providers(&self) -> Vec<ProviderKind> {
        ProviderKind::ALL
            .into_iter()
            .filter(|k| self.gateways.contains_key(k))
            .collect()
    }

    pub fn has_provider(&self, kind: ProviderKind) -> bool {
        self.gateways.contains_key(&kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullGateway;

    #[async_trait]
    impl PaymentGateway for NullGateway {
        fn provider(&self) -> ProviderKind {
            ProviderKind::Stripe
        }

        fn signature_header(&self) -> &'static str {
            "x-null-signature"
        }

        async fn create_payment(
            &self,
            _order: &Order,
            _amount: Amount,
            _currency: Currency,
        ) -> EngineResult<ProviderHandle> {
            Err(EngineError::Internal("unused".into()))
        }

        async fn confirm_payment(
            &self,
            _transaction_id: &str,
            _confirmation_token: Option<&str>,
        ) -> EngineResult<PaymentResult> {
            Err(EngineError::Internal("unused".into()))
        }

        async fn get_status(&self, _transaction_id: &str) -> EngineResult<PaymentResult> {
            Err(EngineError::Internal("unused".into()))
        }

        async fn refund(
            &self,
            _transaction_id: &str,
            _amount: Amount,
            _currency: Currency,
            _reason: Option<&str>,
        ) -> EngineResult<ProviderRefund> {
            Err(EngineError::Internal("unused".into()))
        }

        async fn verify_webhook(
            &self,
            _payload: &[u8],
            _signature: &str,
        ) -> EngineResult<ProviderEvent> {
            Err(EngineError::InvalidSignature("unused".into()))
        }
    }

    #[test]
    fn test_registry_lookup() {
        let registry = GatewayRegistry::new().with_gateway(Arc::new(NullGateway));

        assert!(registry.resolve("stripe").is_ok());
        assert!(registry.resolve("STRIPE").is_ok());
        assert_eq!(registry.providers(), vec![ProviderKind::Stripe]);
    }

    #[test]
    fn test_unregistered_and_unknown_providers() {
        let registry = GatewayRegistry::new().with_gateway(Arc::new(NullGateway));

        assert!(matches!(
            registry.resolve("bkash"),
            Err(EngineError::UnsupportedProvider { .. })
        ));
        assert!(matches!(
            registry.resolve("paypal"),
            Err(EngineError::UnsupportedProvider { .. })
        ));
    }

    #[test]
    fn test_continuation_serialization() {
        let json = serde_json::to_value(Continuation::RedirectUrl("https://pay".into())).unwrap();
        assert_eq!(json["kind"], "redirect_url");
        assert_eq!(json["value"], "https://pay");
    }
}
