//! # orderpay-stripe
//!
//! Stripe gateway for orderpay, built on the PaymentIntents API.
//!
//! The buyer confirms the card in the browser using the client secret
//! returned by `create_payment`; the outcome arrives as a
//! `payment_intent.*` webhook or through `get_status`.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use orderpay_core::{GatewayRegistry, PaymentGateway};
//! use orderpay_stripe::StripeGateway;
//!
//! let stripe = StripeGateway::from_env()?;
//! let gateways = GatewayRegistry::new().with_gateway(Arc::new(stripe));
//! ```
//!
//! ## Webhooks
//!
//! Point the Stripe Dashboard at `/webhook/stripe` and enable
//! [`REQUIRED_WEBHOOK_EVENTS`]. Signatures are checked against
//! `STRIPE_WEBHOOK_SECRET` with a five minute timestamp tolerance.

pub mod config;
pub mod gateway;
pub mod webhook;

// Re-exports
pub use config::StripeConfig;
pub use gateway::{normalize_status, StripeGateway};
pub use webhook::{sign_payload, REQUIRED_WEBHOOK_EVENTS};
