//! # orderpay-bkash
//!
//! bKash checkout gateway for orderpay.
//!
//! The buyer is redirected to the `bkashURL` returned by `create_payment`,
//! approves the charge in their wallet, and the engine executes the payment
//! through `confirm_payment`. Amounts are sent as decimal strings in BDT.
//!
//! ```rust,ignore
//! use orderpay_bkash::BkashGateway;
//!
//! let bkash = BkashGateway::from_env()?;
//! let gateways = GatewayRegistry::new().with_gateway(Arc::new(bkash));
//! ```

pub mod config;
pub mod gateway;
pub mod webhook;

pub use config::BkashConfig;
pub use gateway::{normalize_status, BkashGateway};
pub use webhook::{sign_payload, SIGNATURE_HEADER};
