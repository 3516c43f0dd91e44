//! # Engine
//!
//! Facade over the checkout saga, reconciliation and refunds. This is the
//! surface the API layer calls.

use crate::builder::OrderBuilder;
use crate::checkout::{CheckoutOrchestrator, CheckoutResult};
use crate::config::EngineConfig;
use crate::reconcile::{Ack, PaymentOutcome, WebhookReconciler};
use crate::refund::{RefundProcessor, RefundResult};
use crate::stock::StockLedger;
use orderpay_core::{
    Amount, CartItem, Catalog, EngineError, EngineResult, GatewayRegistry, Order, OrderStatus,
    OrderStore, Payment, PaymentStatus, Product, ProviderKind,
};
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

/// The order/payment transaction engine
#[derive(Clone)]
pub struct Engine {
    config: EngineConfig,
    store: Arc<dyn OrderStore>,
    ledger: Arc<StockLedger>,
    gateways: GatewayRegistry,
    checkout: CheckoutOrchestrator,
    reconciler: WebhookReconciler,
    refunds: RefundProcessor,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        catalog: Arc<dyn Catalog>,
        store: Arc<dyn OrderStore>,
        gateways: GatewayRegistry,
    ) -> EngineResult<Self> {
        config.validate()?;

        let ledger = Arc::new(StockLedger::new(config.reservation_ttl));
        let builder = OrderBuilder::new(catalog, Arc::clone(&ledger), config.max_cart_lines);

        let checkout = CheckoutOrchestrator::new(
            builder,
            Arc::clone(&ledger),
            Arc::clone(&store),
            gateways.clone(),
            config.provider_timeout,
            config.max_transition_retries,
        );
        let reconciler = WebhookReconciler::new(
            Arc::clone(&ledger),
            Arc::clone(&store),
            gateways.clone(),
            config.provider_timeout,
            config.max_transition_retries,
        );
        let refunds = RefundProcessor::new(
            Arc::clone(&ledger),
            Arc::clone(&store),
            gateways.clone(),
            config.provider_timeout,
            config.max_transition_retries,
            config.restock_on_refund,
        );

        Ok(Self {
            config,
            store,
            ledger,
            gateways,
            checkout,
            reconciler,
            refunds,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn ledger(&self) -> &StockLedger {
        &self.ledger
    }

    /// Seed the ledger from catalog products. Products already tracked keep
    /// their live counters.
    pub async fn track_products(&self, products: &[Product]) {
        for product in products {
            self.ledger.track(product).await;
        }
    }

    pub fn providers(&self) -> Vec<ProviderKind> {
        self.gateways.providers()
    }

    /// Header carrying the webhook signature for a provider
    pub fn signature_header(&self, provider: &str) -> EngineResult<&'static str> {
        Ok(self.gateways.resolve(provider)?.signature_header())
    }

    pub async fn checkout(
        &self,
        user_id: &str,
        cart: &[CartItem],
        provider: &str,
        notes: &str,
    ) -> EngineResult<CheckoutResult> {
        let result = self.checkout.checkout(user_id, cart, provider, notes).await?;
        self.apply_settled_at_creation(result).await
    }

    pub async fn resume_checkout(
        &self,
        order_id: Uuid,
        user_id: &str,
        provider: &str,
    ) -> EngineResult<CheckoutResult> {
        let result = self
            .checkout
            .resume_checkout(order_id, user_id, provider)
            .await?;
        self.apply_settled_at_creation(result).await
    }

    /// Some providers settle (or decline) in the create call itself.
    async fn apply_settled_at_creation(
        &self,
        mut result: CheckoutResult,
    ) -> EngineResult<CheckoutResult> {
        let reason = match result.provider_status {
            PaymentStatus::Succeeded => None,
            PaymentStatus::Failed => Some("declined at creation".to_string()),
            _ => return Ok(result),
        };

        info!(
            payment_id = %result.payment_id,
            status = %result.provider_status,
            "Provider settled payment at creation"
        );
        self.reconciler
            .apply(result.payment_id, result.provider_status, reason)
            .await?;
        result.status = self.get_payment(result.payment_id).await?.status;
        Ok(result)
    }

    pub async fn cancel_order(&self, order_id: Uuid, user_id: &str) -> EngineResult<Order> {
        self.checkout.cancel_order(order_id, user_id).await
    }

    pub async fn confirm_payment(
        &self,
        payment_id: Uuid,
        confirmation_token: Option<&str>,
    ) -> EngineResult<PaymentOutcome> {
        self.reconciler.confirm(payment_id, confirmation_token).await
    }

    pub async fn get_payment_status(&self, transaction_id: &str) -> EngineResult<PaymentOutcome> {
        self.reconciler.poll(transaction_id).await
    }

    pub async fn handle_webhook(
        &self,
        provider: &str,
        payload: &[u8],
        signature: &str,
    ) -> EngineResult<Ack> {
        self.reconciler.handle(provider, payload, signature).await
    }

    pub async fn refund_payment(
        &self,
        payment_id: Uuid,
        amount: Option<Amount>,
        reason: Option<&str>,
    ) -> EngineResult<RefundResult> {
        self.refunds.refund(payment_id, amount, reason).await
    }

    /// Release reservations past their TTL. Meant to run on an interval.
    #[instrument(skip(self))]
    pub async fn sweep_expired_reservations(&self) -> usize {
        self.ledger.release_expired().await
    }

    /// Compensate checkouts interrupted mid-saga. Meant to run at startup.
    pub async fn recover_incomplete_checkouts(&self) -> EngineResult<usize> {
        self.checkout.recover_incomplete().await
    }

    pub async fn get_order(&self, order_id: Uuid) -> EngineResult<Order> {
        self.store
            .get_order(order_id)
            .await?
            .ok_or(EngineError::OrderNotFound { order_id })
    }

    pub async fn get_payment(&self, payment_id: Uuid) -> EngineResult<Payment> {
        self.store
            .get_payment(payment_id)
            .await?
            .ok_or(EngineError::PaymentNotFound { payment_id })
    }

    pub async fn payments_for_order(&self, order_id: Uuid) -> EngineResult<Vec<Payment>> {
        self.store.payments_for_order(order_id).await
    }

    /// An order and its payment attempts, visible to its owner only.
    pub async fn order_details(
        &self,
        order_id: Uuid,
        user_id: &str,
    ) -> EngineResult<(Order, Vec<Payment>)> {
        let order = self.checkout.owned_order(order_id, user_id).await?;
        let payments = self.store.payments_for_order(order.id).await?;
        Ok((order, payments))
    }

    #[instrument(skip(self))]
    pub async fn list_orders(
        &self,
        user_id: &str,
        status: Option<OrderStatus>,
    ) -> EngineResult<Vec<Order>> {
        require_user(user_id)?;
        self.store.orders_for_user(user_id, status).await
    }

    #[instrument(skip(self))]
    pub async fn list_payments(
        &self,
        user_id: &str,
        status: Option<PaymentStatus>,
    ) -> EngineResult<Vec<Payment>> {
        require_user(user_id)?;
        self.store.payments_for_user(user_id, status).await
    }
}

fn require_user(user_id: &str) -> EngineResult<()> {
    if user_id.trim().is_empty() {
        return Err(EngineError::Validation("user_id is required".to_string()));
    }
    Ok(())
}
