//! # bKash Webhook Handling
//!
//! Notifications are signed with a hex HMAC-SHA256 of the raw body under
//! the merchant webhook secret, sent in `X-Bkash-Signature`.

use crate::gateway::normalize_status;
use chrono::Utc;
use hmac::{Hmac, Mac};
use orderpay_core::{
    Amount, EngineError, EngineResult, EventOutcome, PaymentStatus, ProviderEvent, ProviderKind,
};
use serde::Deserialize;
use sha2::Sha256;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-bkash-signature";

/// Hex HMAC-SHA256 of `payload`
pub fn sign_payload(secret: &str, payload: &[u8]) -> EngineResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| EngineError::Configuration(format!("Invalid webhook secret: {}", e)))?;
    mac.update(payload);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

pub(crate) fn verify_signature(secret: &str, payload: &[u8], signature: &str) -> EngineResult<()> {
    let provided = hex::decode(signature.trim())
        .map_err(|_| EngineError::InvalidSignature("Signature is not hex".to_string()))?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| EngineError::Configuration(format!("Invalid webhook secret: {}", e)))?;
    mac.update(payload);

    mac.verify_slice(&provided)
        .map_err(|_| EngineError::InvalidSignature("Signature mismatch".to_string()))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BkashNotification {
    #[serde(rename = "paymentID")]
    payment_id: String,
    #[serde(default, rename = "trxID")]
    trx_id: Option<String>,
    transaction_status: String,
    #[serde(default)]
    amount: Option<String>,
    #[serde(default)]
    status_message: Option<String>,
}

pub(crate) fn parse_event(payload: &[u8]) -> EngineResult<ProviderEvent> {
    let raw: serde_json::Value = serde_json::from_slice(payload)
        .map_err(|e| EngineError::MalformedPayload(format!("Failed to parse webhook: {}", e)))?;
    let notification: BkashNotification = serde_json::from_value(raw.clone())
        .map_err(|e| EngineError::MalformedPayload(format!("Unexpected webhook shape: {}", e)))?;

    debug!(
        "Verified bKash webhook: payment={}, status={}",
        notification.payment_id, notification.transaction_status
    );

    let outcome = match normalize_status(&notification.transaction_status) {
        PaymentStatus::Succeeded => EventOutcome::Succeeded,
        PaymentStatus::Failed => EventOutcome::Failed,
        _ => EventOutcome::Other(notification.transaction_status.clone()),
    };

    let amount = match notification.amount.as_deref() {
        Some(value) => Some(value.parse::<Amount>().map_err(|_| {
            EngineError::MalformedPayload(format!("Invalid amount {:?}", value))
        })?),
        None => None,
    };

    let failure_reason = match outcome {
        EventOutcome::Failed => notification
            .status_message
            .clone()
            .or_else(|| Some(format!("bKash status {}", notification.transaction_status))),
        _ => None,
    };

    let event_id = notification.trx_id.clone().unwrap_or_else(|| {
        format!(
            "{}:{}",
            notification.payment_id, notification.transaction_status
        )
    });

    Ok(ProviderEvent {
        event_id,
        provider: ProviderKind::Bkash,
        transaction_id: Some(notification.payment_id),
        outcome,
        amount,
        failure_reason,
        provider_metadata: raw,
        occurred_at: Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const SECRET: &str = "bkash-hook-secret";

    fn body(status: &str) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "paymentID": "TR0011abc",
            "trxID": "9ABC123",
            "transactionStatus": status,
            "amount": "500.00",
            "currency": "BDT",
            "merchantInvoiceNumber": "ORDER-1"
        }))
        .unwrap()
    }

    #[test]
    fn test_signature_round_trip() {
        let payload = body("Completed");
        let sig = sign_payload(SECRET, &payload).unwrap();
        assert!(verify_signature(SECRET, &payload, &sig).is_ok());
        assert!(matches!(
            verify_signature("other", &payload, &sig),
            Err(EngineError::InvalidSignature(_))
        ));
        assert!(verify_signature(SECRET, &payload, "zz-not-hex").is_err());
    }

    #[test]
    fn test_completed_notification() {
        let event = parse_event(&body("Completed")).unwrap();
        assert_eq!(event.transaction_id.as_deref(), Some("TR0011abc"));
        assert_eq!(event.event_id, "9ABC123");
        assert_eq!(event.outcome, EventOutcome::Succeeded);
        assert_eq!(event.amount, Some(Amount::from_minor(50_000)));
        assert_eq!(event.provider, ProviderKind::Bkash);
    }

    #[test]
    fn test_failed_and_intermediate_notifications() {
        let event = parse_event(&body("Failed")).unwrap();
        assert_eq!(event.outcome, EventOutcome::Failed);
        assert!(event.failure_reason.is_some());

        let event = parse_event(&body("Initiated")).unwrap();
        assert_eq!(event.outcome, EventOutcome::Other("Initiated".into()));
    }

    #[test]
    fn test_malformed_notification() {
        assert!(matches!(
            parse_event(b"{\"trxID\": \"x\"}"),
            Err(EngineError::MalformedPayload(_))
        ));
        assert!(parse_event(b"<xml/>").is_err());
    }
}
