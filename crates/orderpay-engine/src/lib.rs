//! # orderpay-engine
//!
//! The order/payment transaction engine: stock reservation, the checkout
//! saga, webhook reconciliation and refunds.
//!
//! ```text
//! client ─▶ CheckoutOrchestrator ─▶ OrderBuilder ─▶ StockLedger (reserve)
//!                    │
//!                    └─▶ PaymentGateway (create) ─▶ client continuation
//!
//! provider ─▶ WebhookReconciler ─▶ StockLedger (finalize | release)
//!                               └─▶ Order / Payment state
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use orderpay_engine::{Engine, EngineConfig};
//!
//! let engine = Engine::new(EngineConfig::from_env()?, catalog, store, gateways)?;
//! let result = engine
//!     .checkout("user-1", &[CartItem::new("kb-87", 1)], "stripe", "")
//!     .await?;
//! ```

pub mod builder;
pub mod checkout;
pub mod config;
pub mod engine;
pub mod reconcile;
pub mod refund;
pub mod stock;
mod versioned;

pub use builder::{BuiltOrder, OrderBuilder};
pub use checkout::{CheckoutOrchestrator, CheckoutResult};
pub use config::EngineConfig;
pub use engine::Engine;
pub use reconcile::{Ack, Disposition, PaymentOutcome, WebhookReconciler};
pub use refund::{RefundProcessor, RefundResult};
pub use stock::{
    AttemptFinalization, FinalizeOutcome, Reservation, ReservationState, StockLedger,
};
