//! # Routes
//!
//! Axum router configuration for the order/payment API.

use crate::handlers;
use crate::state::AppState;
use axum::{
    routing::{get, post},
    Router,
};
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

/// Create the main application router
///
/// Routes:
/// - GET  /health
/// - POST /api/v1/checkout
/// - GET  /api/v1/orders?user_id=&status=
/// - GET  /api/v1/orders/{order_id}?user_id=
/// - POST /api/v1/orders/{order_id}/cancel
/// - POST /api/v1/orders/{order_id}/retry
/// - GET  /api/v1/payments?user_id=&status=
/// - POST /api/v1/payments/{payment_id}/confirm
/// - GET  /api/v1/payments/status/{transaction_id}
/// - POST /api/v1/payments/{payment_id}/refund
/// - POST /webhook/{provider} (raw body)
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let order_routes = Router::new()
        .route("/{order_id}", get(handlers::get_order))
        .route("/{order_id}/cancel", post(handlers::cancel_order))
        .route("/{order_id}/retry", post(handlers::retry_checkout));

    let payment_routes = Router::new()
        .route("/{payment_id}/confirm", post(handlers::confirm_payment))
        .route("/{payment_id}/refund", post(handlers::refund_payment))
        .route("/status/{transaction_id}", get(handlers::payment_status));

    let api_routes = Router::new()
        .route("/checkout", post(handlers::checkout))
        .route("/orders", get(handlers::list_orders))
        .route("/payments", get(handlers::list_payments))
        .nest("/orders", order_routes)
        .nest("/payments", payment_routes);

    // Webhooks verify the raw body, so nothing may rewrite it
    let webhook_routes = Router::new().route("/{provider}", post(handlers::webhook));

    Router::new()
        .route("/health", get(handlers::health))
        .nest("/api/v1", api_routes)
        .nest("/webhook", webhook_routes)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
        .with_state(state)
}
