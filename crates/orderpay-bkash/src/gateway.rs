//! # bKash Checkout Gateway
//!
//! Redirect flow: create a payment, send the buyer to `bkashURL`, then
//! execute it once they approve in the wallet. Every call after the token
//! grant carries the grant token in `Authorization` and the app key in
//! `X-APP-Key`.

use crate::config::BkashConfig;
use crate::webhook;
use async_trait::async_trait;
use orderpay_core::{
    Amount, Continuation, Currency, EngineError, EngineResult, Order, PaymentGateway,
    PaymentResult, PaymentStatus, ProviderEvent, ProviderHandle, ProviderKind, ProviderRefund,
};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, error, info, instrument, warn};

const PROVIDER: &str = "bkash";

/// Refresh the grant token a little before bKash expires it
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

struct GrantToken {
    value: String,
    expires_at: Instant,
}

/// bKash gateway
pub struct BkashGateway {
    config: BkashConfig,
    client: Client,
    token: RwLock<Option<GrantToken>>,
}

/// Map a bKash `transactionStatus` onto the engine's payment statuses
pub fn normalize_status(status: &str) -> PaymentStatus {
    match status {
        "Completed" => PaymentStatus::Succeeded,
        "Authorized" => PaymentStatus::Processing,
        "Failed" | "Cancelled" | "Expired" => PaymentStatus::Failed,
        _ => PaymentStatus::Pending,
    }
}

impl BkashGateway {
    pub fn new(config: BkashConfig) -> EngineResult<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| {
                EngineError::Configuration(format!("Failed to create HTTP client: {}", e))
            })?;

        Ok(Self {
            config,
            client,
            token: RwLock::new(None),
        })
    }

    /// Create from environment variables
    pub fn from_env() -> EngineResult<Self> {
        Self::new(BkashConfig::from_env()?)
    }

    pub fn config(&self) -> &BkashConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url, path)
    }

    /// Return the cached grant token, requesting a new one when missing or stale.
    async fn token(&self) -> EngineResult<String> {
        if let Some(token) = self.token.read().await.as_ref() {
            if token.expires_at > Instant::now() {
                return Ok(token.value.clone());
            }
        }

        let mut slot = self.token.write().await;
        if let Some(token) = slot.as_ref() {
            if token.expires_at > Instant::now() {
                return Ok(token.value.clone());
            }
        }

        let request = self
            .client
            .post(self.url("/checkout/token/grant"))
            .header("username", &self.config.username)
            .header("password", &self.config.password)
            .json(&json!({
                "app_key": self.config.app_key,
                "app_secret": self.config.app_secret,
            }));

        let (status, body) = self.execute(request).await?;
        let (grant, _): (TokenGrant, _) = Self::decode(status, &body)?;

        let lifetime = Duration::from_secs(grant.expires_in.unwrap_or(3600))
            .saturating_sub(TOKEN_EXPIRY_MARGIN);
        *slot = Some(GrantToken {
            value: grant.id_token.clone(),
            expires_at: Instant::now() + lifetime,
        });

        info!("bKash token obtained successfully");
        Ok(grant.id_token)
    }

    async fn authorized(&self, request: RequestBuilder) -> EngineResult<RequestBuilder> {
        let token = self.token().await?;
        Ok(request
            .header("Authorization", token)
            .header("X-APP-Key", &self.config.app_key))
    }

    async fn execute(&self, request: RequestBuilder) -> EngineResult<(StatusCode, String)> {
        let response = request.send().await.map_err(|e| self.transport_error(e))?;
        let status = response.status();
        let body = response.text().await.map_err(|e| self.transport_error(e))?;
        Ok((status, body))
    }

    /// Send an authorized request and decode the body.
    async fn send<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
    ) -> EngineResult<(T, serde_json::Value)> {
        let (status, body) = self.execute(request).await?;

        if status == StatusCode::UNAUTHORIZED {
            warn!("bKash rejected the grant token, clearing cache");
            *self.token.write().await = None;
        }

        Self::decode(status, &body)
    }

    /// bKash reports many failures with HTTP 200 and an error code in the
    /// body, so both the status and the body are checked.
    fn decode<T: DeserializeOwned>(
        status: StatusCode,
        body: &str,
    ) -> EngineResult<(T, serde_json::Value)> {
        let parsed = serde_json::from_str::<serde_json::Value>(body);

        if !status.is_success() {
            error!("bKash API error: status={}", status);
            let message = parsed
                .ok()
                .and_then(|raw| serde_json::from_value::<BkashError>(raw).ok())
                .and_then(BkashError::message)
                .unwrap_or_else(|| format!("HTTP {}: {}", status, body));
            return Err(EngineError::provider(PROVIDER, message));
        }

        let raw = parsed.map_err(|e| {
            EngineError::Serialization(format!("Failed to parse bKash response: {}", e))
        })?;

        if let Some(message) = serde_json::from_value::<BkashError>(raw.clone())
            .ok()
            .and_then(BkashError::message)
        {
            error!("bKash API error in body");
            return Err(EngineError::provider(PROVIDER, message));
        }

        let typed = serde_json::from_value(raw.clone()).map_err(|e| {
            EngineError::Serialization(format!("Unexpected bKash response shape: {}", e))
        })?;

        Ok((typed, raw))
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

    fn to_result(payment: BkashPayment, raw: serde_json::Value) -> EngineResult<PaymentResult> {
        let status_text = payment.transaction_status.unwrap_or_default();
        let amount = payment
            .amount
            .as_deref()
            .map(str::parse::<Amount>)
            .transpose()?;
        let currency = payment
            .currency
            .as_deref()
            .map(str::parse::<Currency>)
            .transpose()?;

        Ok(PaymentResult {
            transaction_id: payment.payment_id,
            status: normalize_status(&status_text),
            provider_status: status_text,
            amount,
            currency,
            raw_response: raw,
        })
    }
}

#[async_trait]
impl PaymentGateway for BkashGateway {
    fn provider(&self) -> ProviderKind {
        ProviderKind::Bkash
    }

    fn signature_header(&self) -> &'static str {
        webhook::SIGNATURE_HEADER
    }

    #[instrument(skip(self, order), fields(order_id = %order.id, amount = %amount))]
    async fn create_payment(
        &self,
        order: &Order,
        amount: Amount,
        currency: Currency,
    ) -> EngineResult<ProviderHandle> {
        if currency != Currency::BDT {
            return Err(EngineError::Validation(format!(
                "bKash only settles in BDT, got {}",
                currency
            )));
        }

        let body = json!({
            "amount": amount.to_string(),
            "currency": currency.to_string(),
            "intent": "sale",
            "merchantInvoiceNumber": format!("ORDER-{}", order.id),
        });

        debug!("Creating bKash payment");

        let request = self
            .authorized(self.client.post(self.url("/checkout/payment/create")))
            .await?
            .json(&body);

        let (created, raw): (BkashPayment, _) = self.send(request).await?;

        let redirect = created.bkash_url.clone().ok_or_else(|| {
            EngineError::Serialization("bKash create response has no bkashURL".to_string())
        })?;

        info!("bKash payment created: {}", created.payment_id);

        Ok(ProviderHandle {
            status: normalize_status(created.transaction_status.as_deref().unwrap_or("Initiated")),
            transaction_id: created.payment_id,
            continuation: Continuation::RedirectUrl(redirect),
            raw_response: raw,
        })
    }

    #[instrument(skip(self, _confirmation_token))]
    async fn confirm_payment(
        &self,
        transaction_id: &str,
        _confirmation_token: Option<&str>,
    ) -> EngineResult<PaymentResult> {
        let request = self
            .authorized(self.client.post(self.url(&format!(
                "/checkout/payment/execute/{}",
                transaction_id
            ))))
            .await?;

        let (payment, raw) = self.send(request).await?;
        info!("bKash payment executed: {}", transaction_id);
        Self::to_result(payment, raw)
    }

    #[instrument(skip(self))]
    async fn get_status(&self, transaction_id: &str) -> EngineResult<PaymentResult> {
        let request = self
            .authorized(self.client.get(self.url(&format!(
                "/checkout/payment/query/{}",
                transaction_id
            ))))
            .await?;

        let (payment, raw) = self.send(request).await?;
        Self::to_result(payment, raw)
    }

    #[instrument(skip(self, reason), fields(amount = %amount))]
    async fn refund(
        &self,
        transaction_id: &str,
        amount: Amount,
        _currency: Currency,
        reason: Option<&str>,
    ) -> EngineResult<ProviderRefund> {
        let mut body = json!({
            "paymentID": transaction_id,
            "amount": amount.to_string(),
        });
        if let Some(reason) = reason {
            body["reason"] = json!(reason);
        }

        let request = self
            .authorized(self.client.post(self.url("/checkout/payment/refund")))
            .await?
            .json(&body);

        let (refund, raw): (BkashRefund, _) = self.send(request).await?;

        info!("bKash refund created: {}", refund.refund_trx_id);

        let refunded = match refund.amount.as_deref() {
            Some(value) => value.parse()?,
            None => amount,
        };

        Ok(ProviderRefund {
            refund_id: refund.refund_trx_id,
            status: refund.transaction_status.unwrap_or_else(|| "Completed".to_string()),
            amount: refunded,
            raw_response: raw,
        })
    }

    #[instrument(skip(self, payload, signature))]
    async fn verify_webhook(&self, payload: &[u8], signature: &str) -> EngineResult<ProviderEvent> {
        webhook::verify_signature(&self.config.webhook_secret, payload, signature)?;
        webhook::parse_event(payload)
    }
}

// =============================================================================
// bKash API Types
// =============================================================================

#[derive(Debug, Deserialize)]
struct TokenGrant {
    id_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BkashPayment {
    #[serde(rename = "paymentID")]
    payment_id: String,
    #[serde(default, rename = "bkashURL")]
    bkash_url: Option<String>,
    #[serde(default)]
    transaction_status: Option<String>,
    #[serde(default)]
    amount: Option<String>,
    #[serde(default)]
    currency: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BkashRefund {
    #[serde(rename = "refundTrxID")]
    refund_trx_id: String,
    #[serde(default)]
    transaction_status: Option<String>,
    #[serde(default)]
    amount: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BkashError {
    #[serde(default)]
    error_code: Option<String>,
    #[serde(default)]
    error_message: Option<String>,
    #[serde(default)]
    status_code: Option<String>,
    #[serde(default)]
    status_message: Option<String>,
}

impl BkashError {
    /// Error text if the body describes a failure
    fn message(self) -> Option<String> {
        if let Some(code) = self.error_code {
            return Some(format!(
                "{} ({})",
                self.error_message.unwrap_or_else(|| "bKash error".to_string()),
                code
            ));
        }
        match self.status_code {
            Some(code) if code != "0000" => Some(format!(
                "{} ({})",
                self.status_message.unwrap_or_else(|| "bKash error".to_string()),
                code
            )),
            _ => None,
        }
    }
}
