//! # Order Types
//!
//! Orders, their line items, and the order status state machine.

use crate::catalog::Product;
use crate::error::{EngineError, EngineResult};
use crate::money::Amount;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// A requested cart line, as supplied by the caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartItem {
    pub product_id: String,
    /// Signed so that zero and negative input can be rejected explicitly
    pub quantity: i64,
}

impl CartItem {
    pub fn new(product_id: impl Into<String>, quantity: i64) -> Self {
        Self {
            product_id: product_id.into(),
            quantity,
        }
    }
}

/// A line item frozen at order time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderItem {
    pub product_id: String,

    /// Product name (denormalized for display)
    pub name: String,

    pub quantity: u32,

    /// Catalog price captured when the order was built
    pub unit_price: Amount,

    /// `quantity * unit_price`
    pub subtotal: Amount,
}

impl OrderItem {
    /// Snapshot a product's current price into a line item
    pub fn from_product(product: &Product, quantity: u32) -> EngineResult<Self> {
        let subtotal = product.price.checked_mul(quantity).ok_or_else(|| {
            EngineError::Validation(format!("Subtotal overflow for {}", product.id))
        })?;

        Ok(Self {
            product_id: product.id.clone(),
            name: product.name.clone(),
            quantity,
            unit_price: product.price,
            subtotal,
        })
    }
}

/// Order lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    /// Created; awaiting a successful payment
    Pending,
    /// A payment succeeded
    Paid,
    /// Cancelled before payment
    Cancelled,
    /// Payment fully refunded
    Refunded,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Paid => "paid",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Refunded => "refunded",
        }
    }

    /// Forward-only transition table
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        matches!(
            (self, next),
            (Pending, Paid) | (Pending, Cancelled) | (Paid, Refunded)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Cancelled | OrderStatus::Refunded)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A priced order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,

    /// Owning user (supplied by the authentication collaborator)
    pub user_id: String,

    pub items: Vec<OrderItem>,

    /// Always equal to the sum of item subtotals
    pub total: Amount,

    pub status: OrderStatus,

    #[serde(default)]
    pub notes: String,

    /// Optimistic concurrency version, bumped by the store on every update
    #[serde(default)]
    pub version: u64,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Create a pending order; the total is derived from the items.
    pub fn new(
        user_id: impl Into<String>,
        items: Vec<OrderItem>,
        notes: impl Into<String>,
    ) -> EngineResult<Self> {
        if items.is_empty() {
            return Err(EngineError::Validation(
                "Order must contain at least one item".to_string(),
            ));
        }

        let total = Amount::checked_sum(items.iter().map(|i| i.subtotal))
            .ok_or_else(|| EngineError::Validation("Order total overflow".to_string()))?;

        let now = Utc::now();
        Ok(Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            items,
            total,
            status: OrderStatus::Pending,
            notes: notes.into(),
            version: 0,
            created_at: now,
            updated_at: now,
        })
    }

    /// Move to `next`, rejecting backwards or sideways moves
    pub fn transition(&mut self, next: OrderStatus) -> EngineResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(EngineError::Validation(format!(
                "Illegal order transition {} -> {}",
                self.status, next
            )));
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Sum of item subtotals, recomputed
    pub fn items_total(&self) -> Amount {
        self.items.iter().map(|i| i.subtotal).sum()
    }

    /// Get item count
    pub fn item_count(&self) -> u64 {
        self.items.iter().map(|i| u64::from(i.quantity)).sum()
    }
}
