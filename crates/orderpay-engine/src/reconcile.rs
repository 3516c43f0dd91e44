//! # Webhook Reconciler
//!
//! Turns provider outcomes into order/payment state. Webhooks, explicit
//! confirmation and status polling all go through [`WebhookReconciler::apply`],
//! so concurrent deliveries of the same outcome converge on one transition.
//!
//! The provider transaction id is the idempotency key. The versioned
//! payment write decides which delivery wins; only the winner touches stock
//! and the order.

use crate::stock::StockLedger;
use crate::versioned::{mutate_order, mutate_payment, with_provider_timeout};
use orderpay_core::{
    EngineError, EngineResult, EventOutcome, GatewayRegistry, OrderStatus, OrderStore, Payment,
    PaymentResult, PaymentStatus,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// What happened to an outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "status")]
pub enum Disposition {
    /// The payment moved to this status
    Applied(PaymentStatus),
    /// Payment was already in the target status
    Duplicate,
    /// Outcome no longer applies to the payment's status
    Stale,
    /// Event type the engine does not act on
    Ignored,
}

/// Acknowledgement returned to the webhook caller
#[derive(Debug, Clone, Serialize)]
pub struct Ack {
    pub event_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    pub disposition: Disposition,
}

/// Local view of a payment after a provider round-trip
#[derive(Debug, Clone, Serialize)]
pub struct PaymentOutcome {
    pub payment_id: Uuid,
    pub order_id: Uuid,
    pub transaction_id: String,
    pub status: PaymentStatus,
    pub provider_status: String,
    pub disposition: Disposition,
}

/// Consumes provider outcomes and advances order/payment state
#[derive(Clone)]
pub struct WebhookReconciler {
    ledger: Arc<StockLedger>,
    store: Arc<dyn OrderStore>,
    gateways: GatewayRegistry,
    provider_timeout: Duration,
    max_retries: u32,
}

impl WebhookReconciler {
    pub fn new(
        ledger: Arc<StockLedger>,
        store: Arc<dyn OrderStore>,
        gateways: GatewayRegistry,
        provider_timeout: Duration,
        max_retries: u32,
    ) -> Self {
        Self {
            ledger,
            store,
            gateways,
            provider_timeout,
            max_retries,
        }
    }

    /// Verify, parse and apply a webhook delivery.
    #[instrument(skip(self, payload, signature), fields(provider = %provider, bytes = payload.len()))]
    pub async fn handle(
        &self,
        provider: &str,
        payload: &[u8],
        signature: &str,
    ) -> EngineResult<Ack> {
        let gateway = self.gateways.resolve(provider)?;

        let event = gateway.verify_webhook(payload, signature).await.map_err(|e| {
            warn!(error = %e, "Rejected webhook");
            e
        })?;

        if let EventOutcome::Other(kind) = &event.outcome {
            info!(event_type = %kind, event_id = %event.event_id, "Ignoring webhook event");
            return Ok(Ack {
                event_id: event.event_id,
                transaction_id: event.transaction_id,
                disposition: Disposition::Ignored,
            });
        }

        let Some(transaction_id) = event.transaction_id.clone() else {
            return Err(EngineError::MalformedPayload(format!(
                "Event {} carries no transaction id",
                event.event_id
            )));
        };

        let payment = self
            .store
            .find_payment_by_transaction(&transaction_id)
            .await?
            .filter(|p| p.provider == event.provider);

        let Some(payment) = payment else {
            warn!(
                transaction_id = %transaction_id,
                event_id = %event.event_id,
                "Webhook for unknown transaction"
            );
            return Err(EngineError::UnknownTransaction { transaction_id });
        };

        if let (Some(reported), EventOutcome::Succeeded) = (event.amount, &event.outcome) {
            if reported != payment.amount {
                warn!(
                    payment_id = %payment.id,
                    reported = %reported,
                    expected = %payment.amount,
                    "Provider reported a different amount"
                );
            }
        }

        let disposition = match &event.outcome {
            EventOutcome::Succeeded => {
                self.apply(payment.id, PaymentStatus::Succeeded, None).await?
            }
            EventOutcome::Failed => {
                let reason = event
                    .failure_reason
                    .clone()
                    .unwrap_or_else(|| "payment failed".to_string());
                self.apply(payment.id, PaymentStatus::Failed, Some(reason))
                    .await?
            }
            EventOutcome::Other(_) => Disposition::Ignored,
        };

        Ok(Ack {
            event_id: event.event_id,
            transaction_id: event.transaction_id,
            disposition,
        })
    }

    /// Execute a payment that needs an explicit confirm step.
    #[instrument(skip(self, confirmation_token), fields(payment_id = %payment_id))]
    pub async fn confirm(
        &self,
        payment_id: Uuid,
        confirmation_token: Option<&str>,
    ) -> EngineResult<PaymentOutcome> {
        let payment = self.load_payment(payment_id).await?;
        let transaction_id = Self::transaction_of(&payment)?;
        let gateway = self.gateways.get(payment.provider)?;

        let result = with_provider_timeout(
            payment.provider.as_str(),
            self.provider_timeout,
            gateway.confirm_payment(&transaction_id, confirmation_token),
        )
        .await?;

        self.converge(payment, result).await
    }

    /// Ask the provider for a transaction's status and apply it.
    #[instrument(skip(self))]
    pub async fn poll(&self, transaction_id: &str) -> EngineResult<PaymentOutcome> {
        let payment = self
            .store
            .find_payment_by_transaction(transaction_id)
            .await?
            .ok_or_else(|| EngineError::UnknownTransaction {
                transaction_id: transaction_id.to_string(),
            })?;
        let gateway = self.gateways.get(payment.provider)?;

        let result = with_provider_timeout(
            payment.provider.as_str(),
            self.provider_timeout,
            gateway.get_status(transaction_id),
        )
        .await?;

        self.converge(payment, result).await
    }

    async fn converge(&self, payment: Payment, result: PaymentResult) -> EngineResult<PaymentOutcome> {
        let reason = match result.status {
            PaymentStatus::Failed => Some(format!("provider status {}", result.provider_status)),
            _ => None,
        };
        let disposition = self.apply(payment.id, result.status, reason).await?;
        let current = self.load_payment(payment.id).await?;

        Ok(PaymentOutcome {
            payment_id: current.id,
            order_id: current.order_id,
            transaction_id: current.transaction_id.unwrap_or(result.transaction_id),
            status: current.status,
            provider_status: result.provider_status,
            disposition,
        })
    }

    /// The transition rule shared by webhooks, confirm and polling.
    ///
    /// - success on pending/processing: payment `succeeded`, order `paid`,
    ///   stock finalized
    /// - failure on pending/processing: payment `failed`, the attempt's stock
    ///   released, order stays `pending`
    /// - processing on pending: payment `processing`
    /// - outcome equal to the current status: duplicate
    /// - anything else: stale
    pub async fn apply(
        &self,
        payment_id: Uuid,
        target: PaymentStatus,
        reason: Option<String>,
    ) -> EngineResult<Disposition> {
        let (payment, applied) = mutate_payment(&*self.store, payment_id, self.max_retries, |p| {
            let eligible = match target {
                PaymentStatus::Succeeded | PaymentStatus::Failed => p.status.is_in_flight(),
                PaymentStatus::Processing => p.status == PaymentStatus::Pending,
                _ => false,
            };
            if !eligible {
                return Ok(None);
            }
            p.transition(target)?;
            if target == PaymentStatus::Failed {
                p.error_message = reason.clone();
            }
            Ok(Some(()))
        })
        .await?;

        if applied.is_none() {
            return Ok(self.classify_noop(&payment, target));
        }

        info!(
            payment_id = %payment.id,
            order_id = %payment.order_id,
            status = %payment.status,
            "Payment transitioned"
        );

        match target {
            PaymentStatus::Succeeded => self.settle_order(&payment).await?,
            PaymentStatus::Failed => {
                let released = self.ledger.release_attempt(payment.id).await;
                warn!(
                    order_id = %payment.order_id,
                    payment_id = %payment.id,
                    released_units = released,
                    "Payment failed, stock released"
                );
            }
            _ => {}
        }

        Ok(Disposition::Applied(target))
    }

    fn classify_noop(&self, payment: &Payment, target: PaymentStatus) -> Disposition {
        let duplicate = match target {
            PaymentStatus::Succeeded => matches!(
                payment.status,
                PaymentStatus::Succeeded
                    | PaymentStatus::PartiallyRefunded
                    | PaymentStatus::Refunded
            ),
            other => payment.status == other,
        };

        if duplicate {
            info!(payment_id = %payment.id, status = %payment.status, "Duplicate outcome ignored");
            Disposition::Duplicate
        } else {
            if target == PaymentStatus::Succeeded {
                // Money moved for a payment we already gave up on
                warn!(
                    payment_id = %payment.id,
                    status = %payment.status,
                    "Success reported for a closed payment"
                );
            } else {
                info!(
                    payment_id = %payment.id,
                    status = %payment.status,
                    target = %target,
                    "Stale outcome ignored"
                );
            }
            Disposition::Stale
        }
    }

    /// Finalize stock and mark the order paid after a winning success.
    async fn settle_order(&self, payment: &Payment) -> EngineResult<()> {
        let summary = self.ledger.finalize_attempt(payment.id).await;

        if summary.has_shortfall() {
            error!(
                order_id = %payment.order_id,
                payment_id = %payment.id,
                shortfalls = ?summary.shortfalls,
                "Captured payment without stock"
            );
            let shortfalls = serde_json::json!(summary
                .shortfalls
                .iter()
                .map(|(product_id, missing)| serde_json::json!({
                    "product_id": product_id,
                    "missing": missing,
                }))
                .collect::<Vec<_>>());
            mutate_payment(&*self.store, payment.id, self.max_retries, |p| {
                p.metadata
                    .insert("stock_shortfall".to_string(), shortfalls.clone());
                Ok(Some(()))
            })
            .await?;
        }

        let (order, _) = mutate_order(&*self.store, payment.order_id, self.max_retries, |o| {
            if o.status != OrderStatus::Pending {
                return Ok(None);
            }
            o.transition(OrderStatus::Paid)?;
            Ok(Some(()))
        })
        .await?;

        if order.status == OrderStatus::Paid {
            info!(order_id = %order.id, "Order paid");
        } else {
            warn!(
                order_id = %order.id,
                status = %order.status,
                "Payment succeeded for an order that is not pending"
            );
        }
        Ok(())
    }

    async fn load_payment(&self, payment_id: Uuid) -> EngineResult<Payment> {
        self.store
            .get_payment(payment_id)
            .await?
            .ok_or(EngineError::PaymentNotFound { payment_id })
    }

    fn transaction_of(payment: &Payment) -> EngineResult<String> {
        payment.transaction_id.clone().ok_or_else(|| {
            EngineError::Validation(format!(
                "Payment {} has no provider transaction yet",
                payment.id
            ))
        })
    }
}
