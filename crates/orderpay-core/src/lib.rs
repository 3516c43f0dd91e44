//! # orderpay-core
//!
//! Core types and traits for the orderpay transaction engine.
//!
//! This crate provides:
//! - `Amount` and `Currency` fixed-point money types
//! - `Order`, `OrderItem` and `Payment` with their status state machines
//! - `PaymentGateway` trait and `GatewayRegistry` for provider adapters
//! - `Catalog` and `OrderStore` collaborator traits with in-memory implementations
//! - `EngineError` for typed error handling
//!
//! ## Example
//!
//! ```rust,ignore
//! use orderpay_core::{Amount, GatewayRegistry, InMemoryCatalog, Product};
//!
//! let catalog = InMemoryCatalog::from_products([
//!     Product::new("kb-87", "Keyboard", "89.90".parse()?).with_stock(10),
//! ]);
//!
//! let gateways = GatewayRegistry::new().with_gateway(Arc::new(stripe_gateway));
//! let gateway = gateways.resolve("stripe")?;
//! ```

pub mod catalog;
pub mod error;
pub mod gateway;
pub mod money;
pub mod order;
pub mod payment;
pub mod store;

// Re-exports for convenience
pub use catalog::{Catalog, CatalogFile, InMemoryCatalog, Product, ProductStatus};
pub use error::{redact_secrets, EngineError, EngineResult};
pub use gateway::{
    Continuation, EventOutcome, GatewayRegistry, PaymentGateway, PaymentResult, ProviderEvent,
    ProviderHandle, ProviderRefund, SharedGateway,
};
pub use money::{Amount, Currency};
pub use order::{CartItem, Order, OrderItem, OrderStatus};
pub use payment::{Payment, PaymentStatus, ProviderKind, RefundRecord};
pub use store::{InMemoryStore, OrderStore, SagaStep, SagaStepKind};
