//! # orderpay-api
//!
//! HTTP API layer for the order/payment engine.

pub mod handlers;
pub mod routes;
pub mod state;

pub use routes::create_router;
pub use state::{AppConfig, AppState};
