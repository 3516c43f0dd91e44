//! Scripted in-process gateway, gated store and engine harness for
//! scenario tests.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use orderpay_core::{
    Amount, Continuation, Currency, EngineError, EngineResult, EventOutcome, GatewayRegistry,
    InMemoryCatalog, InMemoryStore, Order, OrderStatus, OrderStore, Payment, PaymentGateway,
    PaymentResult, PaymentStatus, Product, ProviderEvent, ProviderHandle, ProviderKind,
    ProviderRefund, SagaStep,
};
use orderpay_engine::{Engine, EngineConfig};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use uuid::Uuid;

pub const VALID_SIGNATURE: &str = "valid-signature";

/// Gateway whose answers are set by the test
pub struct ScriptedGateway {
    kind: ProviderKind,
    fail_create: AtomicBool,
    create_delay: Mutex<Option<Duration>>,
    create_status: Mutex<PaymentStatus>,
    provider_status: Mutex<PaymentStatus>,
    fail_refund: AtomicBool,
    counter: AtomicU64,
    pub refunds: Mutex<Vec<(String, Amount)>>,
}

impl ScriptedGateway {
    pub fn new(kind: ProviderKind) -> Self {
        Self {
            kind,
            fail_create: AtomicBool::new(false),
            create_delay: Mutex::new(None),
            create_status: Mutex::new(PaymentStatus::Pending),
            provider_status: Mutex::new(PaymentStatus::Succeeded),
            fail_refund: AtomicBool::new(false),
            counter: AtomicU64::new(0),
            refunds: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn delay_create(&self, delay: Duration) {
        *self.create_delay.lock().unwrap() = Some(delay);
    }

    /// Status returned by the create call itself
    pub fn settle_on_create(&self, status: PaymentStatus) {
        *self.create_status.lock().unwrap() = status;
    }

    /// Status reported by confirm and status queries
    pub fn report_status(&self, status: PaymentStatus) {
        *self.provider_status.lock().unwrap() = status;
    }

    pub fn fail_refund(&self, fail: bool) {
        self.fail_refund.store(fail, Ordering::SeqCst);
    }

    pub fn created(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }

    fn result(&self, transaction_id: &str) -> PaymentResult {
        let status = *self.provider_status.lock().unwrap();
        PaymentResult {
            transaction_id: transaction_id.to_string(),
            status,
            provider_status: status.to_string(),
            amount: None,
            currency: None,
            raw_response: serde_json::Value::Null,
        }
    }
}

#[async_trait]
impl PaymentGateway for ScriptedGateway {
    fn provider(&self) -> ProviderKind {
        self.kind
    }

    fn signature_header(&self) -> &'static str {
        "x-test-signature"
    }

    async fn create_payment(
        &self,
        order: &Order,
        _amount: Amount,
        _currency: Currency,
    ) -> EngineResult<ProviderHandle> {
        let delay = *self.create_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(EngineError::provider(self.kind.as_str(), "card_declined"));
        }

        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let transaction_id = format!("{}_txn_{}", self.kind, n);
        let continuation = match self.kind {
            ProviderKind::Stripe => Continuation::ClientSecret(format!("{}_secret", transaction_id)),
            ProviderKind::Bkash => {
                Continuation::RedirectUrl(format!("https://pay.test/{}", order.id))
            }
        };

        Ok(ProviderHandle {
            transaction_id,
            continuation,
            status: *self.create_status.lock().unwrap(),
            raw_response: serde_json::Value::Null,
        })
    }

    async fn confirm_payment(
        &self,
        transaction_id: &str,
        _confirmation_token: Option<&str>,
    ) -> EngineResult<PaymentResult> {
        Ok(self.result(transaction_id))
    }

    async fn get_status(&self, transaction_id: &str) -> EngineResult<PaymentResult> {
        Ok(self.result(transaction_id))
    }

    async fn refund(
        &self,
        transaction_id: &str,
        amount: Amount,
        _currency: Currency,
        _reason: Option<&str>,
    ) -> EngineResult<ProviderRefund> {
        if self.fail_refund.load(Ordering::SeqCst) {
            return Err(EngineError::provider(self.kind.as_str(), "refund declined"));
        }
        let mut refunds = self.refunds.lock().unwrap();
        refunds.push((transaction_id.to_string(), amount));
        Ok(ProviderRefund {
            refund_id: format!("re_{}", refunds.len()),
            status: "succeeded".to_string(),
            amount,
            raw_response: serde_json::Value::Null,
        })
    }

    async fn verify_webhook(&self, payload: &[u8], signature: &str) -> EngineResult<ProviderEvent> {
        if signature != VALID_SIGNATURE {
            return Err(EngineError::InvalidSignature("Signature mismatch".into()));
        }
        let body: serde_json::Value = serde_json::from_slice(payload)
            .map_err(|e| EngineError::MalformedPayload(e.to_string()))?;

        let field = |name: &str| body[name].as_str().map(str::to_string);
        let transaction_id = field("transaction_id");
        let outcome = match field("outcome").as_deref() {
            Some("succeeded") => EventOutcome::Succeeded,
            Some("failed") => EventOutcome::Failed,
            other => EventOutcome::Other(other.unwrap_or_default().to_string()),
        };

        Ok(ProviderEvent {
            event_id: field("id").unwrap_or_else(|| "evt_test".to_string()),
            provider: self.kind,
            transaction_id,
            outcome,
            amount: field("amount").and_then(|a| a.parse().ok()),
            failure_reason: field("reason"),
            provider_metadata: body,
            occurred_at: Utc::now(),
        })
    }
}

/// Webhook body understood by [`ScriptedGateway::verify_webhook`]
pub fn webhook(event_id: &str, transaction_id: &str, outcome: &str) -> Vec<u8> {
    serde_json::json!({
        "id": event_id,
        "transaction_id": transaction_id,
        "outcome": outcome,
    })
    .to_string()
    .into_bytes()
}

pub fn amount(s: &str) -> Amount {
    s.parse().unwrap()
}

pub fn product(id: &str, price: &str, stock: u64) -> Product {
    Product::new(id, id.to_uppercase(), amount(price)).with_stock(stock)
}

/// In-memory store whose payment writes can be paused or failed on demand
pub struct GatedStore {
    inner: Arc<InMemoryStore>,
    hold_failed_write: AtomicBool,
    fail_refund_write: AtomicBool,
    /// Signalled once a held write has been committed
    pub committed: Notify,
    /// Lets a held write return to its caller
    pub resume: Notify,
}

impl GatedStore {
    pub fn new(inner: Arc<InMemoryStore>) -> Self {
        Self {
            inner,
            hold_failed_write: AtomicBool::new(false),
            fail_refund_write: AtomicBool::new(false),
            committed: Notify::new(),
            resume: Notify::new(),
        }
    }

    /// Hold the next write that marks a payment failed until `resume`.
    pub fn hold_next_failure(&self) {
        self.hold_failed_write.store(true, Ordering::SeqCst);
    }

    /// Reject the next write that records a refund.
    pub fn fail_next_refund_write(&self) {
        self.fail_refund_write.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl OrderStore for GatedStore {
    async fn insert_checkout(&self, order: &Order, payment: &Payment) -> EngineResult<()> {
        self.inner.insert_checkout(order, payment).await
    }

    async fn insert_payment(&self, payment: &Payment) -> EngineResult<()> {
        self.inner.insert_payment(payment).await
    }

    async fn get_order(&self, order_id: Uuid) -> EngineResult<Option<Order>> {
        self.inner.get_order(order_id).await
    }

    async fn get_payment(&self, payment_id: Uuid) -> EngineResult<Option<Payment>> {
        self.inner.get_payment(payment_id).await
    }

    async fn find_payment_by_transaction(
        &self,
        transaction_id: &str,
    ) -> EngineResult<Option<Payment>> {
        self.inner.find_payment_by_transaction(transaction_id).await
    }

    async fn payments_for_order(&self, order_id: Uuid) -> EngineResult<Vec<Payment>> {
        self.inner.payments_for_order(order_id).await
    }

    async fn orders_for_user(
        &self,
        user_id: &str,
        status: Option<OrderStatus>,
    ) -> EngineResult<Vec<Order>> {
        self.inner.orders_for_user(user_id, status).await
    }

    async fn payments_for_user(
        &self,
        user_id: &str,
        status: Option<PaymentStatus>,
    ) -> EngineResult<Vec<Payment>> {
        self.inner.payments_for_user(user_id, status).await
    }

    async fn update_order(&self, order: &Order) -> EngineResult<Order> {
        self.inner.update_order(order).await
    }

    async fn update_payment(&self, payment: &Payment) -> EngineResult<Payment> {
        if !payment.refunds.is_empty() && self.fail_refund_write.swap(false, Ordering::SeqCst) {
            return Err(EngineError::Internal("store unavailable".to_string()));
        }

        let stored = self.inner.update_payment(payment).await;
        if payment.status == PaymentStatus::Failed
            && stored.is_ok()
            && self.hold_failed_write.swap(false, Ordering::SeqCst)
        {
            self.committed.notify_one();
            self.resume.notified().await;
        }
        stored
    }

    async fn append_saga_step(&self, step: SagaStep) -> EngineResult<()> {
        self.inner.append_saga_step(step).await
    }

    async fn saga_steps(&self) -> EngineResult<Vec<SagaStep>> {
        self.inner.saga_steps().await
    }
}

pub struct Harness {
    pub engine: Engine,
    pub catalog: Arc<InMemoryCatalog>,
    pub store: Arc<InMemoryStore>,
    pub gate: Arc<GatedStore>,
    pub stripe: Arc<ScriptedGateway>,
    pub bkash: Arc<ScriptedGateway>,
}

impl Harness {
    pub fn new(products: Vec<Product>) -> Self {
        Self::with_config(products, EngineConfig::default())
    }

    pub fn with_config(products: Vec<Product>, config: EngineConfig) -> Self {
        let catalog = Arc::new(InMemoryCatalog::from_products(products));
        let store = Arc::new(InMemoryStore::new());
        let gate = Arc::new(GatedStore::new(store.clone()));
        let stripe = Arc::new(ScriptedGateway::new(ProviderKind::Stripe));
        let bkash = Arc::new(ScriptedGateway::new(ProviderKind::Bkash));

        let gateways = GatewayRegistry::new()
            .with_gateway(stripe.clone())
            .with_gateway(bkash.clone());

        let engine = Engine::new(config, catalog.clone(), gate.clone(), gateways).unwrap();

        Self {
            engine,
            catalog,
            store,
            gate,
            stripe,
            bkash,
        }
    }

    pub async fn deliver(&self, provider: &str, body: &[u8]) -> EngineResult<orderpay_engine::Ack> {
        self.engine
            .handle_webhook(provider, body, VALID_SIGNATURE)
            .await
    }
}
