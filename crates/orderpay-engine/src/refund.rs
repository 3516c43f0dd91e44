//! # Refund Processor
//!
//! Reverses settled payments. A refund first places a hold on the payment
//! (a versioned write), so two concurrent refunds cannot both pass the
//! captured-amount check. The hold is cleared when the provider answers,
//! either way. Money the provider already returned is always recorded on
//! the payment, even when the normal bookkeeping write fails.

use crate::stock::StockLedger;
use crate::versioned::{mutate_order, mutate_payment, with_provider_timeout};
use chrono::Utc;
use orderpay_core::{
    Amount, EngineError, EngineResult, GatewayRegistry, OrderStatus, OrderStore, Payment,
    PaymentStatus, RefundRecord,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct RefundResult {
    pub payment_id: Uuid,
    pub order_id: Uuid,
    pub refund_id: String,
    pub amount: Amount,
    /// Total refunded on the payment so far, this refund included
    pub refunded_total: Amount,
    pub payment_status: PaymentStatus,
    pub order_status: OrderStatus,
    /// Units returned to stock by this refund
    pub restocked_units: u64,
}

#[derive(Clone)]
pub struct RefundProcessor {
    ledger: Arc<StockLedger>,
    store: Arc<dyn OrderStore>,
    gateways: GatewayRegistry,
    provider_timeout: Duration,
    max_retries: u32,
    restock_on_refund: bool,
}

impl RefundProcessor {
    pub fn new(
        ledger: Arc<StockLedger>,
        store: Arc<dyn OrderStore>,
        gateways: GatewayRegistry,
        provider_timeout: Duration,
        max_retries: u32,
        restock_on_refund: bool,
    ) -> Self {
        Self {
            ledger,
            store,
            gateways,
            provider_timeout,
            max_retries,
            restock_on_refund,
        }
    }

    /// Refund `amount` (or everything still refundable) of a settled payment.
    #[instrument(skip(self, reason), fields(payment_id = %payment_id))]
    pub async fn refund(
        &self,
        payment_id: Uuid,
        amount: Option<Amount>,
        reason: Option<&str>,
    ) -> EngineResult<RefundResult> {
        let (held, requested) = self.place_hold(payment_id, amount).await?;

        let transaction_id = match held.transaction_id.clone() {
            Some(tid) => tid,
            None => {
                self.clear_hold(payment_id).await;
                return Err(EngineError::Internal(format!(
                    "Settled payment {} has no transaction id",
                    payment_id
                )));
            }
        };

        let refunded = async {
            let gateway = self.gateways.get(held.provider)?;
            with_provider_timeout(
                held.provider.as_str(),
                self.provider_timeout,
                gateway.refund(&transaction_id, requested, held.currency, reason),
            )
            .await
        }
        .await;

        let provider_refund = match refunded {
            Ok(refund) => refund,
            Err(e) => {
                error!(payment_id = %payment_id, error = %e, "Provider refund failed");
                self.clear_hold(payment_id).await;
                return Err(e);
            }
        };

        let record = RefundRecord {
            refund_id: provider_refund.refund_id.clone(),
            amount: requested,
            reason: reason.unwrap_or_default().to_string(),
            created_at: Utc::now(),
        };

        let recorded = mutate_payment(&*self.store, payment_id, self.max_retries, |p| {
            p.refund_hold = None;
            p.refunded_amount = p.refunded_amount.checked_add(requested).ok_or_else(|| {
                EngineError::Internal("Refunded amount overflow".to_string())
            })?;
            p.refunds.push(record.clone());
            let next = if p.refunded_amount >= p.amount {
                PaymentStatus::Refunded
            } else {
                PaymentStatus::PartiallyRefunded
            };
            p.transition(next)?;
            Ok(Some(()))
        })
        .await;

        let payment = match recorded {
            Ok((payment, _)) => payment,
            Err(e) => {
                error!(
                    payment_id = %payment_id,
                    refund_id = %record.refund_id,
                    amount = %requested,
                    error = %e,
                    "Provider refunded but the refund could not be recorded"
                );
                self.record_unreconciled(payment_id, &record).await;
                return Err(e);
            }
        };

        info!(
            payment_id = %payment.id,
            refund_id = %provider_refund.refund_id,
            amount = %requested,
            status = %payment.status,
            "Refund recorded"
        );

        let (order_status, restocked_units) = if payment.status == PaymentStatus::Refunded {
            self.close_order(&payment).await?
        } else {
            let order = self
                .store
                .get_order(payment.order_id)
                .await?
                .ok_or(EngineError::OrderNotFound {
                    order_id: payment.order_id,
                })?;
            (order.status, 0)
        };

        Ok(RefundResult {
            payment_id: payment.id,
            order_id: payment.order_id,
            refund_id: provider_refund.refund_id,
            amount: requested,
            refunded_total: payment.refunded_amount,
            payment_status: payment.status,
            order_status,
            restocked_units,
        })
    }

    async fn place_hold(
        &self,
        payment_id: Uuid,
        amount: Option<Amount>,
    ) -> EngineResult<(Payment, Amount)> {
        let (held, requested) = mutate_payment(&*self.store, payment_id, self.max_retries, |p| {
            if !p.status.is_refundable() {
                return Err(EngineError::NotRefundable {
                    payment_id,
                    status: p.status.to_string(),
                });
            }
            if p.refund_hold.is_some() {
                return Err(EngineError::Conflict {
                    entity: "payment",
                    id: payment_id,
                });
            }

            let refundable = p.refundable_amount();
            let requested = amount.unwrap_or(refundable);
            if !requested.is_positive() {
                return Err(EngineError::Validation(
                    "Refund amount must be positive".to_string(),
                ));
            }
            if requested > refundable {
                return Err(EngineError::AmountExceedsCaptured {
                    requested,
                    refundable,
                });
            }

            p.refund_hold = Some(requested);
            Ok(Some(requested))
        })
        .await?;

        let requested = requested.ok_or_else(|| {
            EngineError::Internal("Refund hold was not placed".to_string())
        })?;
        Ok((held, requested))
    }

    async fn clear_hold(&self, payment_id: Uuid) {
        let cleared = mutate_payment(&*self.store, payment_id, self.max_retries, |p| {
            if p.refund_hold.is_none() {
                return Ok(None);
            }
            p.refund_hold = None;
            Ok(Some(()))
        })
        .await;

        if let Err(e) = cleared {
            error!(payment_id = %payment_id, error = %e, "Failed to clear refund hold");
        }
    }

    /// Fallback bookkeeping after the provider moved money: keep the
    /// refund on the payment and release the hold, leaving the status alone.
    async fn record_unreconciled(&self, payment_id: Uuid, record: &RefundRecord) {
        let saved = mutate_payment(&*self.store, payment_id, self.max_retries, |p| {
            if p.refunds.iter().any(|r| r.refund_id == record.refund_id) {
                return Ok(None);
            }
            p.refund_hold = None;
            p.refunded_amount = p
                .refunded_amount
                .checked_add(record.amount)
                .unwrap_or(p.amount);
            p.refunds.push(record.clone());
            p.metadata.insert(
                "unreconciled_refund".to_string(),
                serde_json::json!(record.refund_id),
            );
            Ok(Some(()))
        })
        .await;

        if let Err(e) = saved {
            error!(
                payment_id = %payment_id,
                refund_id = %record.refund_id,
                amount = %record.amount,
                error = %e,
                "Refund hold left in place; manual reconciliation needed"
            );
        }
    }

    /// Fully refunded: order becomes `refunded` and, by policy, the payment's
    /// items go back to stock. Both happen only on that transition.
    async fn close_order(&self, payment: &Payment) -> EngineResult<(OrderStatus, u64)> {
        let (order, moved) = mutate_order(&*self.store, payment.order_id, self.max_retries, |o| {
            if !o.status.can_transition_to(OrderStatus::Refunded) {
                return Ok(None);
            }
            o.transition(OrderStatus::Refunded)?;
            Ok(Some(()))
        })
        .await?;

        if moved.is_none() {
            warn!(
                order_id = %order.id,
                status = %order.status,
                "Order kept its status after full refund; stock not restocked"
            );
            return Ok((order.status, 0));
        }

        let restocked = if self.restock_on_refund {
            self.ledger.restock_attempt(payment.id).await
        } else {
            0
        };

        Ok((order.status, restocked))
    }
}
