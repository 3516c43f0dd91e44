//! # Checkout Orchestrator
//!
//! The checkout saga:
//!
//! 1. build the order and reserve stock (nothing persisted on failure)
//! 2. persist order and pending payment together, log `started`
//! 3. create the payment with the provider under a time budget
//! 4. record the transaction id, move the payment to `processing`
//!
//! A failure in step 3 compensates: the payment is marked `failed` and the
//! reservations taken for that attempt are released. The order stays
//! `pending` so the buyer can retry with a new payment, which reserves its
//! own stock under its own payment id.

use crate::builder::OrderBuilder;
use crate::stock::StockLedger;
use crate::versioned::{mutate_order, mutate_payment, with_provider_timeout};
use orderpay_core::{
    Amount, CartItem, Continuation, Currency, EngineError, EngineResult, GatewayRegistry, Order,
    OrderStatus, OrderStore, Payment, PaymentStatus, ProviderKind, SagaStep, SagaStepKind,
    SharedGateway,
};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// What the client needs to finish paying
#[derive(Debug, Clone, Serialize)]
pub struct CheckoutResult {
    pub order_id: Uuid,
    pub payment_id: Uuid,
    pub transaction_id: String,
    pub amount: Amount,
    pub currency: Currency,
    pub provider: ProviderKind,
    pub status: PaymentStatus,
    /// What the provider reported when the payment was created
    pub provider_status: PaymentStatus,
    pub continuation: Continuation,
}

/// Composes the builder, the ledger and a gateway into one checkout
#[derive(Clone)]
pub struct CheckoutOrchestrator {
    builder: OrderBuilder,
    ledger: Arc<StockLedger>,
    store: Arc<dyn OrderStore>,
    gateways: GatewayRegistry,
    provider_timeout: Duration,
    max_retries: u32,
}

impl CheckoutOrchestrator {
    pub fn new(
        builder: OrderBuilder,
        ledger: Arc<StockLedger>,
        store: Arc<dyn OrderStore>,
        gateways: GatewayRegistry,
        provider_timeout: Duration,
        max_retries: u32,
    ) -> Self {
        Self {
            builder,
            ledger,
            store,
            gateways,
            provider_timeout,
            max_retries,
        }
    }

    /// Run a full checkout for a cart.
    #[instrument(skip(self, cart, notes), fields(user_id = %user_id, provider = %provider))]
    pub async fn checkout(
        &self,
        user_id: &str,
        cart: &[CartItem],
        provider: &str,
        notes: &str,
    ) -> EngineResult<CheckoutResult> {
        // Unknown providers fail before anything is reserved or written
        let gateway = self.gateways.resolve(provider)?;

        let built = self.builder.build(user_id, cart, notes).await?;
        let order = built.order;
        let kind = gateway.provider();
        let payment = Payment::new(order.id, kind, order.total, kind.default_currency())
            .with_id(built.attempt_id);

        if let Err(e) = self.store.insert_checkout(&order, &payment).await {
            error!(order_id = %order.id, error = %e, "Failed to persist checkout");
            self.ledger.release_attempt(built.attempt_id).await;
            return Err(e);
        }

        info!(
            order_id = %order.id,
            payment_id = %payment.id,
            total = %order.total,
            "Checkout started"
        );

        self.run_provider_step(gateway, &order, payment).await
    }

    /// Start a new payment attempt for a pending order whose last attempt failed.
    #[instrument(skip(self), fields(order_id = %order_id, provider = %provider))]
    pub async fn resume_checkout(
        &self,
        order_id: Uuid,
        user_id: &str,
        provider: &str,
    ) -> EngineResult<CheckoutResult> {
        let gateway = self.gateways.resolve(provider)?;

        let order = self.owned_order(order_id, user_id).await?;
        if order.status != OrderStatus::Pending {
            return Err(EngineError::Validation(format!(
                "Order {} is {}; only pending orders can be retried",
                order.id, order.status
            )));
        }

        let payments = self.store.payments_for_order(order.id).await?;
        if payments.iter().any(|p| p.status.is_in_flight()) {
            return Err(EngineError::Validation(format!(
                "Order {} already has an active payment",
                order.id
            )));
        }

        let kind = gateway.provider();
        let payment = Payment::new(order.id, kind, order.total, kind.default_currency());

        self.builder
            .reserve_items(payment.id, order.id, &order.items)
            .await?;

        if let Err(e) = self.store.insert_payment(&payment).await {
            self.ledger.release_attempt(payment.id).await;
            return Err(e);
        }

        info!(
            order_id = %order.id,
            payment_id = %payment.id,
            attempt = payments.len() + 1,
            "Checkout retry started"
        );

        self.run_provider_step(gateway, &order, payment).await
    }

    /// Steps 3 and 4 of the saga for a persisted, pending payment.
    async fn run_provider_step(
        &self,
        gateway: SharedGateway,
        order: &Order,
        payment: Payment,
    ) -> EngineResult<CheckoutResult> {
        self.log_step(SagaStep::new(payment.id, order.id, SagaStepKind::Started))
            .await?;

        let created = with_provider_timeout(
            payment.provider.as_str(),
            self.provider_timeout,
            gateway.create_payment(order, payment.amount, payment.currency),
        )
        .await;

        let handle = match created {
            Ok(handle) => handle,
            Err(e) => {
                error!(
                    order_id = %order.id,
                    payment_id = %payment.id,
                    error = %e,
                    "Provider rejected payment creation"
                );
                self.compensate(payment.id, order.id, &e.to_string()).await?;
                return Err(e);
            }
        };

        self.log_step(
            SagaStep::new(payment.id, order.id, SagaStepKind::ProviderCreated)
                .with_detail(handle.transaction_id.clone()),
        )
        .await?;

        let transaction_id = handle.transaction_id.clone();
        let raw_response = handle.raw_response.clone();
        let (saved, moved) = mutate_payment(&*self.store, payment.id, self.max_retries, |p| {
            p.assign_transaction_id(transaction_id.clone())?;
            p.raw_response = raw_response.clone();
            if p.status == PaymentStatus::Pending {
                p.transition(PaymentStatus::Processing)?;
                Ok(Some(true))
            } else {
                // Cancelled or settled while the provider call was in flight
                Ok(Some(false))
            }
        })
        .await?;

        if moved != Some(true) {
            warn!(
                payment_id = %saved.id,
                status = %saved.status,
                "Payment left pending during provider call"
            );
            self.log_step(
                SagaStep::new(saved.id, order.id, SagaStepKind::Compensated)
                    .with_detail(format!("payment already {}", saved.status)),
            )
            .await?;
            return Err(EngineError::Conflict {
                entity: "payment",
                id: saved.id,
            });
        }

        self.log_step(SagaStep::new(saved.id, order.id, SagaStepKind::Completed))
            .await?;

        info!(
            order_id = %order.id,
            payment_id = %saved.id,
            transaction_id = %handle.transaction_id,
            "Checkout awaiting provider confirmation"
        );

        Ok(CheckoutResult {
            order_id: order.id,
            payment_id: saved.id,
            transaction_id: handle.transaction_id,
            amount: saved.amount,
            currency: saved.currency,
            provider: saved.provider,
            status: saved.status,
            provider_status: handle.status,
            continuation: handle.continuation,
        })
    }

    /// Fail an in-flight payment and give the stock of that attempt back.
    pub(crate) async fn compensate(
        &self,
        payment_id: Uuid,
        order_id: Uuid,
        reason: &str,
    ) -> EngineResult<()> {
        let message = reason.to_string();
        mutate_payment(&*self.store, payment_id, self.max_retries, |p| {
            if !p.status.is_in_flight() {
                return Ok(None);
            }
            p.transition(PaymentStatus::Failed)?;
            p.error_message = Some(message.clone());
            Ok(Some(()))
        })
        .await?;

        let released = self.ledger.release_attempt(payment_id).await;

        self.log_step(
            SagaStep::new(payment_id, order_id, SagaStepKind::Compensated).with_detail(reason),
        )
        .await?;

        warn!(
            order_id = %order_id,
            payment_id = %payment_id,
            released_units = released,
            "Checkout compensated"
        );
        Ok(())
    }

    /// Cancel a pending order on behalf of its owner.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn cancel_order(&self, order_id: Uuid, user_id: &str) -> EngineResult<Order> {
        let order = self.owned_order(order_id, user_id).await?;
        if order.status != OrderStatus::Pending {
            return Err(EngineError::NotCancellable {
                order_id,
                status: order.status.to_string(),
            });
        }

        let mut released = 0;
        for payment in self.store.payments_for_order(order_id).await? {
            let (current, _) = mutate_payment(&*self.store, payment.id, self.max_retries, |p| {
                if !p.status.is_in_flight() {
                    return Ok(None);
                }
                p.transition(PaymentStatus::Cancelled)?;
                p.error_message = Some("order cancelled".to_string());
                Ok(Some(()))
            })
            .await?;

            // A settled payment means the order is about to be (or is) paid
            if current.status == PaymentStatus::Succeeded {
                return Err(EngineError::NotCancellable {
                    order_id,
                    status: "paid".to_string(),
                });
            }

            // Failed attempts normally released already; this is a no-op then
            released += self.ledger.release_attempt(current.id).await;
        }

        let (cancelled, _) = mutate_order(&*self.store, order_id, self.max_retries, |o| {
            if o.status != OrderStatus::Pending {
                return Err(EngineError::NotCancellable {
                    order_id,
                    status: o.status.to_string(),
                });
            }
            o.transition(OrderStatus::Cancelled)?;
            Ok(Some(()))
        })
        .await?;

        info!(order_id = %order_id, released_units = released, "Order cancelled");
        Ok(cancelled)
    }

    /// Compensate every checkout attempt that started but never finished.
    #[instrument(skip(self))]
    pub async fn recover_incomplete(&self) -> EngineResult<usize> {
        let mut attempts: HashMap<Uuid, (Uuid, bool)> = HashMap::new();
        for step in self.store.saga_steps().await? {
            let entry = attempts.entry(step.attempt_id).or_insert((step.order_id, false));
            if matches!(step.kind, SagaStepKind::Completed | SagaStepKind::Compensated) {
                entry.1 = true;
            }
        }

        let mut recovered = 0;
        for (payment_id, (order_id, finished)) in attempts {
            if finished {
                continue;
            }
            let in_flight = self
                .store
                .get_payment(payment_id)
                .await?
                .map(|p| p.status.is_in_flight())
                .unwrap_or(false);
            if !in_flight {
                continue;
            }
            warn!(payment_id = %payment_id, order_id = %order_id, "Recovering interrupted checkout");
            self.compensate(payment_id, order_id, "checkout interrupted").await?;
            recovered += 1;
        }

        info!(recovered = recovered, "Saga recovery complete");
        Ok(recovered)
    }

    pub(crate) async fn owned_order(&self, order_id: Uuid, user_id: &str) -> EngineResult<Order> {
        let order = self
            .store
            .get_order(order_id)
            .await?
            .ok_or(EngineError::OrderNotFound { order_id })?;

        if order.user_id != user_id {
            return Err(EngineError::Forbidden(format!(
                "Order {} belongs to another user",
                order_id
            )));
        }
        Ok(order)
    }

    async fn log_step(&self, step: SagaStep) -> EngineResult<()> {
        self.store.append_saga_step(step).await
    }
}
