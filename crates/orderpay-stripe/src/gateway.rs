//! # Stripe PaymentIntents Gateway
//!
//! Client-confirmed card flow: create a PaymentIntent, hand its client
//! secret to the browser, learn the outcome from webhooks or a status query.

use crate::config::StripeConfig;
use crate::webhook;
use async_trait::async_trait;
use orderpay_core::{
    Amount, Continuation, Currency, EngineError, EngineResult, Order, PaymentGateway,
    PaymentResult, PaymentStatus, ProviderEvent, ProviderHandle, ProviderKind, ProviderRefund,
};
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

const PROVIDER: &str = "stripe";

/// Reasons Stripe accepts in the `reason` refund field
const STRIPE_REFUND_REASONS: &[&str] = &["duplicate", "fraudulent", "requested_by_customer"];

/// Stripe gateway backed by the PaymentIntents API
pub struct StripeGateway {
    config: StripeConfig,
    client: Client,
}

impl StripeGateway {
    /// Create a new Stripe gateway
    pub fn new(config: StripeConfig) -> EngineResult<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| {
                EngineError::Configuration(format!("Failed to create HTTP client: {}", e))
            })?;

        Ok(Self { config, client })
    }

    /// Create from environment variables
    pub fn from_env() -> EngineResult<Self> {
        Self::new(StripeConfig::from_env()?)
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.api_base_url, path)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("Authorization", self.config.auth_header())
            .header("Stripe-Version", &self.config.api_version)
    }

    /// Send a request and decode a successful JSON body.
    async fn send<T: for<'de> Deserialize<'de>>(
        &self,
        request: RequestBuilder,
    ) -> EngineResult<(T, serde_json::Value)> {
        let response = self
            .authorized(request)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        let body = response.text().await.map_err(|e| self.transport_error(e))?;

        if !status.is_success() {
            error!("Stripe API error: status={}", status);

            if let Ok(error_response) = serde_json::from_str::<StripeErrorResponse>(&body) {
                let err = error_response.error;
                let message = match err.code {
                    Some(code) => format!("{} ({})", err.message, code),
                    None => err.message,
                };
                return Err(EngineError::provider(PROVIDER, message));
            }

            return Err(EngineError::provider(
                PROVIDER,
                format!("HTTP {}: {}", status, body),
            ));
        }

        let raw: serde_json::Value = serde_json::from_str(&body).map_err(|e| {
            EngineError::Serialization(format!("Failed to parse Stripe response: {}", e))
        })?;
        let typed = serde_json::from_value(raw.clone()).map_err(|e| {
            EngineError::Serialization(format!("Unexpected Stripe response shape: {}", e))
        })?;

        Ok((typed, strip_client_secret(raw)))
    }

    fn transport_error(&self, e: reqwest::Error) -> EngineError {
        if e.is_timeout() {
            EngineError::ProviderTimeout {
                provider: PROVIDER.to_string(),
                timeout_ms: self.config.request_timeout.as_millis() as u64,
            }
        } else {
            EngineError::Network(e.to_string())
        }
    }

    fn to_result(intent: StripePaymentIntent, raw: serde_json::Value) -> PaymentResult {
        let currency = intent.currency.as_deref().and_then(|c| c.parse::<Currency>().ok());
        let amount = intent
            .amount
            .map(|units| currency.unwrap_or_default().from_smallest_unit(units));

        PaymentResult {
            status: normalize_status(&intent.status),
            transaction_id: intent.id,
            provider_status: intent.status,
            amount,
            currency,
            raw_response: raw,
        }
    }
}

/// Map a PaymentIntent status onto the engine's payment statuses
pub fn normalize_status(status: &str) -> PaymentStatus {
    match status {
        "succeeded" => PaymentStatus::Succeeded,
        "processing" | "requires_capture" => PaymentStatus::Processing,
        "canceled" => PaymentStatus::Failed,
        _ => PaymentStatus::Pending,
    }
}

fn strip_client_secret(mut raw: serde_json::Value) -> serde_json::Value {
    if let Some(object) = raw.as_object_mut() {
        object.remove("client_secret");
    }
    raw
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    fn provider(&self) -> ProviderKind {
        ProviderKind::Stripe
    }

    fn signature_header(&self) -> &'static str {
        "stripe-signature"
    }

    #[instrument(skip(self, order), fields(order_id = %order.id, amount = %amount))]
    async fn create_payment(
        &self,
        order: &Order,
        amount: Amount,
        currency: Currency,
    ) -> EngineResult<ProviderHandle> {
        if !amount.is_positive() {
            return Err(EngineError::Validation(
                "Payment amount must be positive".to_string(),
            ));
        }

        let form_params: Vec<(&str, String)> = vec![
            ("amount", currency.to_smallest_unit(amount).to_string()),
            ("currency", currency.as_str().to_string()),
            ("description", format!("Order {}", order.id)),
            ("automatic_payment_methods[enabled]", "true".to_string()),
            ("metadata[order_id]", order.id.to_string()),
            ("metadata[user_id]", order.user_id.clone()),
        ];

        // Fresh key per attempt: a retried checkout is a new intent
        let idempotency_key = Uuid::new_v4().to_string();

        debug!("Creating Stripe PaymentIntent: currency={}", currency);

        let request = self
            .client
            .post(self.url("/v1/payment_intents"))
            .header("Idempotency-Key", &idempotency_key)
            .form(&form_params);

        let (intent, raw): (StripePaymentIntent, _) = self.send(request).await?;

        let client_secret = intent.client_secret.clone().ok_or_else(|| {
            EngineError::Serialization("PaymentIntent response has no client_secret".to_string())
        })?;

        info!("Created Stripe PaymentIntent: id={}", intent.id);

        Ok(ProviderHandle {
            status: normalize_status(&intent.status),
            transaction_id: intent.id,
            continuation: Continuation::ClientSecret(client_secret),
            raw_response: raw,
        })
    }

    #[instrument(skip(self, confirmation_token))]
    async fn confirm_payment(
        &self,
        transaction_id: &str,
        confirmation_token: Option<&str>,
    ) -> EngineResult<PaymentResult> {
        let mut form_params: Vec<(&str, String)> = Vec::new();
        if let Some(token) = confirmation_token {
            form_params.push(("payment_method", token.to_string()));
        }

        let request = self
            .client
            .post(self.url(&format!("/v1/payment_intents/{}/confirm", transaction_id)))
            .form(&form_params);

        let (intent, raw) = self.send(request).await?;
        Ok(Self::to_result(intent, raw))
    }

    #[instrument(skip(self))]
    async fn get_status(&self, transaction_id: &str) -> EngineResult<PaymentResult> {
        let request = self
            .client
            .get(self.url(&format!("/v1/payment_intents/{}", transaction_id)));

        let (intent, raw) = self.send(request).await?;
        Ok(Self::to_result(intent, raw))
    }

    #[instrument(skip(self, reason), fields(amount = %amount))]
    async fn refund(
        &self,
        transaction_id: &str,
        amount: Amount,
        currency: Currency,
        reason: Option<&str>,
    ) -> EngineResult<ProviderRefund> {
        let mut form_params: Vec<(&str, String)> = vec![
            ("payment_intent", transaction_id.to_string()),
            ("amount", currency.to_smallest_unit(amount).to_string()),
        ];

        match reason {
            Some(r) if STRIPE_REFUND_REASONS.contains(&r) => {
                form_params.push(("reason", r.to_string()));
            }
            Some(r) => form_params.push(("metadata[reason]", r.to_string())),
            None => {}
        }

        let request = self
            .client
            .post(self.url("/v1/refunds"))
            .header("Idempotency-Key", Uuid::new_v4().to_string())
            .form(&form_params);

        let (refund, raw): (StripeRefund, _) = self.send(request).await?;

        info!("Created Stripe refund: id={}, status={}", refund.id, refund.status);

        Ok(ProviderRefund {
            refund_id: refund.id,
            status: refund.status,
            amount: refund
                .amount
                .map(|units| currency.from_smallest_unit(units))
                .unwrap_or(amount),
            raw_response: raw,
        })
    }

    #[instrument(skip(self, payload, signature))]
    async fn verify_webhook(&self, payload: &[u8], signature: &str) -> EngineResult<ProviderEvent> {
        webhook::verify_signature(
            &self.config.webhook_secret,
            self.config.webhook_tolerance_secs,
            payload,
            signature,
        )?;
        webhook::parse_event(payload)
    }
}

// =============================================================================
// Stripe API Types
// =============================================================================

#[derive(Debug, Deserialize)]
struct StripePaymentIntent {
    id: String,
    status: String,
    #[serde(default)]
    amount: Option<i64>,
    #[serde(default)]
    currency: Option<String>,
    #[serde(default)]
    client_secret: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StripeRefund {
    id: String,
    status: String,
    #[serde(default)]
    amount: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct StripeErrorResponse {
    error: StripeError,
}

#[derive(Debug, Deserialize)]
struct StripeError {
    message: String,
    #[serde(default)]
    code: Option<String>,
}
