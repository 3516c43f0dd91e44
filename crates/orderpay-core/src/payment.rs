//! # Payment Types
//!
//! Payment records, provider identifiers, and the payment status state machine.

use crate::error::{EngineError, EngineResult};
use crate::money::{Amount, Currency};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Closed set of supported payment providers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Stripe,
    Bkash,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 2] = [ProviderKind::Stripe, ProviderKind::Bkash];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Stripe => "stripe",
            ProviderKind::Bkash => "bkash",
        }
    }

    /// Currency a checkout is charged in for this provider
    pub fn default_currency(&self) -> Currency {
        match self {
            ProviderKind::Stripe => Currency::USD,
            ProviderKind::Bkash => Currency::BDT,
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stripe" => Ok(ProviderKind::Stripe),
            "bkash" => Ok(ProviderKind::Bkash),
            _ => Err(EngineError::UnsupportedProvider {
                provider: s.to_string(),
            }),
        }
    }
}

/// Payment lifecycle
///
/// ```text
/// pending -> processing -> succeeded | failed
/// succeeded -> refunded | partially_refunded
/// pending | processing -> cancelled        (order cancellation)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Processing,
    Succeeded,
    Failed,
    Cancelled,
    PartiallyRefunded,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Processing => "processing",
            PaymentStatus::Succeeded => "succeeded",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Cancelled => "cancelled",
            PaymentStatus::PartiallyRefunded => "partially_refunded",
            PaymentStatus::Refunded => "refunded",
        }
    }

    pub fn can_transition_to(&self, next: PaymentStatus) -> bool {
        use PaymentStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Pending, Succeeded)
                | (Pending, Failed)
                | (Pending, Cancelled)
                | (Processing, Succeeded)
                | (Processing, Failed)
                | (Processing, Cancelled)
                | (Succeeded, PartiallyRefunded)
                | (Succeeded, Refunded)
                | (PartiallyRefunded, PartiallyRefunded)
                | (PartiallyRefunded, Refunded)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PaymentStatus::Failed | PaymentStatus::Cancelled | PaymentStatus::Refunded
        )
    }

    /// Awaiting a provider outcome
    pub fn is_in_flight(&self) -> bool {
        matches!(self, PaymentStatus::Pending | PaymentStatus::Processing)
    }

    pub fn is_refundable(&self) -> bool {
        matches!(
            self,
            PaymentStatus::Succeeded | PaymentStatus::PartiallyRefunded
        )
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One successful refund against a payment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundRecord {
    pub refund_id: String,
    pub amount: Amount,
    #[serde(default)]
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

/// A payment attempt against one provider for one order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    pub id: Uuid,

    pub order_id: Uuid,

    pub provider: ProviderKind,

    /// Provider-assigned id; immutable and globally unique once set
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,

    pub amount: Amount,

    pub currency: Currency,

    pub status: PaymentStatus,

    /// Total refunded so far
    #[serde(default)]
    pub refunded_amount: Amount,

    /// Amount claimed by an in-flight refund call
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refund_hold: Option<Amount>,

    #[serde(default)]
    pub refunds: Vec<RefundRecord>,

    /// Last raw provider response, kept for audit
    #[serde(default)]
    pub raw_response: serde_json::Value,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,

    /// Optimistic concurrency version, bumped by the store on every update
    #[serde(default)]
    pub version: u64,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Payment {
    /// Create a pending payment with no provider transaction yet
    pub fn new(order_id: Uuid, provider: ProviderKind, amount: Amount, currency: Currency) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            order_id,
            provider,
            transaction_id: None,
            amount,
            currency,
            status: PaymentStatus::Pending,
            refunded_amount: Amount::ZERO,
            refund_hold: None,
            refunds: Vec::new(),
            raw_response: serde_json::Value::Null,
            error_message: None,
            metadata: serde_json::Map::new(),
            version: 0,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Use a pre-allocated id (the checkout attempt that reserved stock)
    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    /// Move to `next`, stamping `completed_at` on settlement
    pub fn transition(&mut self, next: PaymentStatus) -> EngineResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(EngineError::Validation(format!(
                "Illegal payment transition {} -> {}",
                self.status, next
            )));
        }

        let now = Utc::now();
        if matches!(
            next,
            PaymentStatus::Succeeded | PaymentStatus::Failed | PaymentStatus::Cancelled
        ) {
            self.completed_at = Some(now);
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    /// Record the provider transaction id; a different id can never replace it
    pub fn assign_transaction_id(&mut self, transaction_id: impl Into<String>) -> EngineResult<()> {
        let transaction_id = transaction_id.into();
        match &self.transaction_id {
            Some(existing) if *existing != transaction_id => Err(EngineError::Internal(format!(
                "Payment {} already bound to transaction {}",
                self.id, existing
            ))),
            _ => {
                self.transaction_id = Some(transaction_id);
                self.updated_at = Utc::now();
                Ok(())
            }
        }
    }

    /// Captured amount not yet refunded or held by an in-flight refund
    pub fn refundable_amount(&self) -> Amount {
        let held = self.refund_hold.unwrap_or(Amount::ZERO);
        self.amount
            .checked_sub(self.refunded_amount)
            .and_then(|rest| rest.checked_sub(held))
            .unwrap_or(Amount::ZERO)
    }
}
