//! # Request Handlers
//!
//! Axum request handlers for the order/payment API. Every handler is a thin
//! translation between JSON and one engine operation.

use crate::state::AppState;
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use orderpay_core::{Amount, CartItem, EngineError, Order, OrderStatus, Payment, PaymentStatus};
use orderpay_engine::{CheckoutResult, PaymentOutcome, RefundResult};
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

// =============================================================================
// Request/Response Types
// =============================================================================

/// Checkout request
#[derive(Debug, Deserialize)]
pub struct CheckoutRequest {
    /// Authenticated user placing the order
    pub user_id: String,
    pub items: Vec<CheckoutItem>,
    /// Payment provider identifier ("stripe", "bkash")
    pub provider: String,
    #[serde(default)]
    pub notes: String,
}

/// Item in checkout request
#[derive(Debug, Deserialize)]
pub struct CheckoutItem {
    pub product_id: String,
    #[serde(default = "default_quantity")]
    pub quantity: i64,
}

fn default_quantity() -> i64 {
    1
}

/// Caller identity for owner-scoped reads
#[derive(Debug, Deserialize)]
pub struct OwnerQuery {
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
pub struct OrderListQuery {
    pub user_id: String,
    #[serde(default)]
    pub status: Option<OrderStatus>,
}

#[derive(Debug, Deserialize)]
pub struct PaymentListQuery {
    pub user_id: String,
    #[serde(default)]
    pub status: Option<PaymentStatus>,
}

#[derive(Debug, Deserialize)]
pub struct CancelRequest {
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
pub struct RetryRequest {
    pub user_id: String,
    pub provider: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct ConfirmRequest {
    #[serde(default)]
    pub confirmation_token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RefundRequest {
    /// Omitted means the full remaining amount
    #[serde(default)]
    pub amount: Option<Amount>,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Order with its payment attempts
#[derive(Debug, Serialize)]
pub struct OrderResponse {
    pub order: Order,
    pub payments: Vec<Payment>,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: u16,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, code: u16) -> Self {
        Self {
            error: error.into(),
            code,
        }
    }
}

/// Engine error rendered as `{error, code}`
#[derive(Debug)]
pub struct ApiError(pub EngineError);

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = self.0.status_code();
        if code >= 500 {
            error!(error = %self.0, "Request failed");
        }
        let status = StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(ErrorResponse::new(self.0.to_string(), code))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

// =============================================================================
// Handlers
// =============================================================================

/// Health check endpoint
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "orderpay",
        "version": env!("CARGO_PKG_VERSION"),
        "providers": state.engine.providers(),
    }))
}

/// Build an order, reserve its stock and start a payment
#[instrument(skip(state, request), fields(user_id = %request.user_id, items = request.items.len()))]
pub async fn checkout(
    State(state): State<AppState>,
    Json(request): Json<CheckoutRequest>,
) -> ApiResult<CheckoutResult> {
    let cart: Vec<CartItem> = request
        .items
        .iter()
        .map(|i| CartItem::new(i.product_id.clone(), i.quantity))
        .collect();

    let result = state
        .engine
        .checkout(&request.user_id, &cart, &request.provider, &request.notes)
        .await?;

    info!(
        order_id = %result.order_id,
        transaction_id = %result.transaction_id,
        "Checkout created"
    );
    Ok(Json(result))
}

pub async fn get_order(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
    Query(query): Query<OwnerQuery>,
) -> ApiResult<OrderResponse> {
    let (order, payments) = state
        .engine
        .order_details(order_id, &query.user_id)
        .await?;
    Ok(Json(OrderResponse { order, payments }))
}

#[instrument(skip(state))]
pub async fn list_orders(
    State(state): State<AppState>,
    Query(query): Query<OrderListQuery>,
) -> ApiResult<Vec<Order>> {
    let orders = state
        .engine
        .list_orders(&query.user_id, query.status)
        .await?;
    Ok(Json(orders))
}

#[instrument(skip(state))]
pub async fn list_payments(
    State(state): State<AppState>,
    Query(query): Query<PaymentListQuery>,
) -> ApiResult<Vec<Payment>> {
    let payments = state
        .engine
        .list_payments(&query.user_id, query.status)
        .await?;
    Ok(Json(payments))
}

#[instrument(skip(state, request))]
pub async fn cancel_order(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
    Json(request): Json<CancelRequest>,
) -> ApiResult<Order> {
    let order = state
        .engine
        .cancel_order(order_id, &request.user_id)
        .await?;
    Ok(Json(order))
}

#[instrument(skip(state, request))]
pub async fn retry_checkout(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
    Json(request): Json<RetryRequest>,
) -> ApiResult<CheckoutResult> {
    let result = state
        .engine
        .resume_checkout(order_id, &request.user_id, &request.provider)
        .await?;
    Ok(Json(result))
}

#[instrument(skip(state, request))]
pub async fn confirm_payment(
    State(state): State<AppState>,
    Path(payment_id): Path<Uuid>,
    request: Option<Json<ConfirmRequest>>,
) -> ApiResult<PaymentOutcome> {
    let request = request.map(|Json(r)| r).unwrap_or_default();
    let outcome = state
        .engine
        .confirm_payment(payment_id, request.confirmation_token.as_deref())
        .await?;
    Ok(Json(outcome))
}

pub async fn payment_status(
    State(state): State<AppState>,
    Path(transaction_id): Path<String>,
) -> ApiResult<PaymentOutcome> {
    Ok(Json(state.engine.get_payment_status(&transaction_id).await?))
}

#[instrument(skip(state, request))]
pub async fn refund_payment(
    State(state): State<AppState>,
    Path(payment_id): Path<Uuid>,
    request: Option<Json<RefundRequest>>,
) -> ApiResult<RefundResult> {
    let request = request.map(|Json(r)| r).unwrap_or_default();
    let result = state
        .engine
        .refund_payment(payment_id, request.amount, request.reason.as_deref())
        .await?;
    Ok(Json(result))
}

/// Handle a provider webhook.
///
/// Deliveries for unknown transactions are acknowledged with 200 so the
/// provider stops redelivering them.
#[instrument(skip(state, headers, body), fields(provider = %provider))]
pub async fn webhook(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let header_name = state.engine.signature_header(&provider)?;

    let signature = headers
        .get(header_name)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            EngineError::InvalidSignature(format!("Missing {} header", header_name))
        })?;

    match state.engine.handle_webhook(&provider, &body, signature).await {
        Ok(ack) => Ok(Json(ack).into_response()),
        Err(e) if e.is_acknowledgeable() => {
            warn!(error = %e, "Acknowledging webhook without applying it");
            Ok((
                StatusCode::OK,
                Json(serde_json::json!({ "received": true, "ignored": e.to_string() })),
            )
                .into_response())
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_response() {
        let err = ErrorResponse::new("Test error", 400);
        assert_eq!(err.error, "Test error");
        assert_eq!(err.code, 400);
    }

    #[test]
    fn test_engine_error_conversion() {
        let response = ApiError(EngineError::Validation("Bad data".to_string())).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = ApiError(EngineError::InsufficientStock {
            product_id: "p".to_string(),
            requested: 2,
            available: 1,
        })
        .into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn test_refund_request_amount_is_optional() {
        let full: RefundRequest = serde_json::from_str("{}").unwrap();
        assert!(full.amount.is_none());

        let partial: RefundRequest =
            serde_json::from_str(r#"{"amount": "12.50", "reason": "damaged"}"#).unwrap();
        assert_eq!(partial.amount, Some(Amount::from_minor(1_250)));
    }
}
