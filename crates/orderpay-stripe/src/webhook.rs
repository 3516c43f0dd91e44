//! # Stripe Webhook Handling
//!
//! `Stripe-Signature` verification and normalization of PaymentIntent
//! events into `ProviderEvent`s.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use orderpay_core::{
    Currency, EngineError, EngineResult, EventOutcome, ProviderEvent, ProviderKind,
};
use serde::Deserialize;
use sha2::Sha256;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

/// Events that should be enabled in the Stripe Dashboard
pub const REQUIRED_WEBHOOK_EVENTS: &[&str] = &[
    "payment_intent.succeeded",
    "payment_intent.payment_failed",
    "payment_intent.canceled",
    "charge.refunded",
];

pub(crate) struct SignatureHeader {
    pub timestamp: i64,
    pub signatures: Vec<String>,
}

pub(crate) fn parse_signature_header(header: &str) -> EngineResult<SignatureHeader> {
    let mut timestamp = None;
    let mut signatures = Vec::new();

    for part in header.split(',') {
        let Some((key, value)) = part.trim().split_once('=') else {
            continue;
        };
        match key {
            "t" => timestamp = value.parse().ok(),
            "v1" => signatures.push(value.to_string()),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or_else(|| {
        EngineError::InvalidSignature("Missing timestamp in signature".to_string())
    })?;

    if signatures.is_empty() {
        return Err(EngineError::InvalidSignature(
            "No v1 signature found".to_string(),
        ));
    }

    Ok(SignatureHeader {
        timestamp,
        signatures,
    })
}

pub(crate) fn compute_hmac_sha256(secret: &str, message: &[u8]) -> EngineResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| EngineError::Configuration(format!("Invalid webhook secret: {}", e)))?;
    mac.update(message);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

pub(crate) fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes()
        .zip(b.bytes())
        .fold(0, |acc, (x, y)| acc | (x ^ y))
        == 0
}

/// Build a `Stripe-Signature` header value for `payload` (useful for tests
/// and local replay tooling).
pub fn sign_payload(secret: &str, timestamp: i64, payload: &[u8]) -> EngineResult<String> {
    let mut signed = format!("{}.", timestamp).into_bytes();
    signed.extend_from_slice(payload);
    Ok(format!("t={},v1={}", timestamp, compute_hmac_sha256(secret, &signed)?))
}

/// Check the signature header against `payload`. Looks at nothing but bytes.
pub(crate) fn verify_signature(
    secret: &str,
    tolerance_secs: i64,
    payload: &[u8],
    header: &str,
) -> EngineResult<()> {
    let parts = parse_signature_header(header)?;

    let now = Utc::now().timestamp();
    let skew = now.checked_sub(parts.timestamp).map(i64::unsigned_abs);
    if skew.map_or(true, |s| s > tolerance_secs.unsigned_abs()) {
        return Err(EngineError::InvalidSignature(
            "Timestamp outside tolerance".to_string(),
        ));
    }

    let mut signed = format!("{}.", parts.timestamp).into_bytes();
    signed.extend_from_slice(payload);
    let expected = compute_hmac_sha256(secret, &signed)?;

    if !parts
        .signatures
        .iter()
        .any(|sig| constant_time_compare(sig, &expected))
    {
        return Err(EngineError::InvalidSignature(
            "Signature mismatch".to_string(),
        ));
    }

    Ok(())
}

#[derive(Debug, Deserialize)]
struct StripeWebhookEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    created: i64,
    data: StripeEventData,
}

#[derive(Debug, Deserialize)]
struct StripeEventData {
    object: serde_json::Map<String, serde_json::Value>,
}

/// Normalize a verified event body
pub(crate) fn parse_event(payload: &[u8]) -> EngineResult<ProviderEvent> {
    let event: StripeWebhookEvent = serde_json::from_slice(payload)
        .map_err(|e| EngineError::MalformedPayload(format!("Failed to parse webhook: {}", e)))?;

    debug!("Verified Stripe webhook: type={}", event.event_type);

    let object = &event.data.object;
    let str_field = |key: &str| object.get(key).and_then(|v| v.as_str()).map(String::from);

    let outcome = match event.event_type.as_str() {
        "payment_intent.succeeded" => EventOutcome::Succeeded,
        "payment_intent.payment_failed" | "payment_intent.canceled" => EventOutcome::Failed,
        other => EventOutcome::Other(other.to_string()),
    };

    // PaymentIntent events carry the intent id; charge events point at it
    let transaction_id = if event.event_type.starts_with("payment_intent.") {
        str_field("id")
    } else {
        str_field("payment_intent")
    };
    if transaction_id.is_none() && !matches!(outcome, EventOutcome::Other(_)) {
        return Err(EngineError::MalformedPayload(format!(
            "Event {} carries no payment intent id",
            event.id
        )));
    }

    let currency = str_field("currency").and_then(|c| c.parse::<Currency>().ok());
    let amount = object
        .get("amount_received")
        .or_else(|| object.get("amount"))
        .and_then(|v| v.as_i64())
        .map(|units| currency.unwrap_or_default().from_smallest_unit(units));

    let failure_reason = object
        .get("last_payment_error")
        .and_then(|e| e.get("message"))
        .and_then(|v| v.as_str())
        .map(String::from)
        .or_else(|| str_field("cancellation_reason"));

    Ok(ProviderEvent {
        event_id: event.id,
        provider: ProviderKind::Stripe,
        transaction_id,
        outcome,
        amount,
        failure_reason,
        provider_metadata: serde_json::Value::Object(event.data.object),
        occurred_at: DateTime::from_timestamp(event.created, 0).unwrap_or_else(Utc::now),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use orderpay_core::Amount;
    use serde_json::json;

    const SECRET: &str = "whsec_test123secret456";

    fn event_body(event_type: &str) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "id": "evt_1",
            "type": event_type,
            "created": 1_700_000_000,
            "data": {
                "object": {
                    "id": "pi_123",
                    "object": "payment_intent",
                    "amount": 10_000,
                    "amount_received": 10_000,
                    "currency": "usd",
                    "last_payment_error": { "message": "Your card was declined." }
                }
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_parse_signature_header() {
        let parsed = parse_signature_header("t=1234567890,v1=abc123,v1=def456").unwrap();

        assert_eq!(parsed.timestamp, 1234567890);
        assert_eq!(parsed.signatures.len(), 2);
        assert_eq!(parsed.signatures[0], "abc123");

        assert!(parse_signature_header("v1=abc").is_err());
        assert!(parse_signature_header("t=1").is_err());
    }

    #[test]
    fn test_hmac_sha256() {
        let sig = compute_hmac_sha256("whsec_test", b"1234567890.{}").unwrap();
        assert_eq!(sig.len(), 64);
    }

    #[test]
    fn test_constant_time_compare() {
        assert!(constant_time_compare("abc123", "abc123"));
        assert!(!constant_time_compare("abc123", "abc124"));
        assert!(!constant_time_compare("abc", "abcd"));
    }

    #[test]
    fn test_valid_signature_accepted() {
        let body = event_body("payment_intent.succeeded");
        let header = sign_payload(SECRET, Utc::now().timestamp(), &body).unwrap();
        assert!(verify_signature(SECRET, 300, &body, &header).is_ok());
    }

    #[test]
    fn test_wrong_secret_and_tampered_body_rejected() {
        let body = event_body("payment_intent.succeeded");
        let now = Utc::now().timestamp();

        let header = sign_payload("whsec_wrong", now, &body).unwrap();
        assert!(matches!(
            verify_signature(SECRET, 300, &body, &header),
            Err(EngineError::InvalidSignature(_))
        ));

        let header = sign_payload(SECRET, now, &body).unwrap();
        let tampered = event_body("payment_intent.payment_failed");
        assert!(verify_signature(SECRET, 300, &tampered, &header).is_err());
    }

    #[test]
    fn test_stale_timestamp_rejected() {
        let body = event_body("payment_intent.succeeded");
        let header = sign_payload(SECRET, Utc::now().timestamp() - 600, &body).unwrap();
        assert!(verify_signature(SECRET, 300, &body, &header).is_err());
    }

    #[test]
    fn test_extreme_timestamps_rejected_without_overflow() {
        let body = event_body("payment_intent.succeeded");
        for header in [
            "t=-9223372036854775808,v1=00",
            "t=9223372036854775807,v1=00",
        ] {
            assert!(matches!(
                verify_signature(SECRET, 300, &body, header),
                Err(EngineError::InvalidSignature(_))
            ));
        }
    }

    #[test]
    fn test_parse_succeeded_event() {
        let event = parse_event(&event_body("payment_intent.succeeded")).unwrap();
        assert_eq!(event.transaction_id.as_deref(), Some("pi_123"));
        assert_eq!(event.outcome, EventOutcome::Succeeded);
        assert_eq!(event.amount, Some(Amount::from_minor(10_000)));
        assert_eq!(event.provider, ProviderKind::Stripe);
    }

    #[test]
    fn test_parse_failed_event_carries_reason() {
        let event = parse_event(&event_body("payment_intent.payment_failed")).unwrap();
        assert_eq!(event.outcome, EventOutcome::Failed);
        assert_eq!(event.failure_reason.as_deref(), Some("Your card was declined."));
    }

    #[test]
    fn test_parse_charge_event_uses_intent_reference() {
        let body = serde_json::to_vec(&json!({
            "id": "evt_2",
            "type": "charge.refunded",
            "created": 1_700_000_000,
            "data": { "object": { "id": "ch_1", "payment_intent": "pi_777", "amount": 500 } }
        }))
        .unwrap();

        let event = parse_event(&body).unwrap();
        assert_eq!(event.transaction_id.as_deref(), Some("pi_777"));
        assert_eq!(event.outcome, EventOutcome::Other("charge.refunded".into()));
    }

    #[test]
    fn test_malformed_payloads() {
        assert!(matches!(
            parse_event(b"not json"),
            Err(EngineError::MalformedPayload(_))
        ));

        let body = serde_json::to_vec(&json!({
            "id": "evt_3",
            "type": "payment_intent.succeeded",
            "created": 1,
            "data": { "object": { "object": "payment_intent", "amount": 100 } }
        }))
        .unwrap();
        assert!(matches!(
            parse_event(&body),
            Err(EngineError::MalformedPayload(_))
        ));
    }

    #[test]
    fn test_events_without_intent_are_passed_through() {
        for event_type in ["customer.created", "payment_method.attached", "charge.succeeded"] {
            let body = serde_json::to_vec(&json!({
                "id": "evt_4",
                "type": event_type,
                "created": 1_700_000_000,
                "data": { "object": { "id": "cus_1" } }
            }))
            .unwrap();

            let event = parse_event(&body).unwrap();
            assert_eq!(event.transaction_id, None);
            assert_eq!(event.outcome, EventOutcome::Other(event_type.into()));
        }
    }
}
