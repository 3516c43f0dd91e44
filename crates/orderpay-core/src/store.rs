//! # Order Store
//!
//! Persistence collaborator for orders, payments and the checkout saga log.
//!
//! Updates use optimistic versioning: the caller passes the record it read,
//! and the write fails with `EngineError::Conflict` if someone else wrote
//! in between. Readers never block writers for longer than a map lookup.

use crate::error::{EngineError, EngineResult};
use crate::order::{Order, OrderStatus};
use crate::payment::{Payment, PaymentStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Step recorded for a checkout attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SagaStepKind {
    /// Order (or retry) and pending payment persisted, stock reserved
    Started,
    /// Provider accepted the payment; transaction id known
    ProviderCreated,
    /// Payment moved to processing; client has its continuation
    Completed,
    /// Payment failed and reservations were released
    Compensated,
}

/// One entry in the checkout saga log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaStep {
    /// Checkout attempt id (the payment id)
    pub attempt_id: Uuid,
    pub order_id: Uuid,
    pub kind: SagaStepKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl SagaStep {
    pub fn new(attempt_id: Uuid, order_id: Uuid, kind: SagaStepKind) -> Self {
        Self {
            attempt_id,
            order_id,
            kind,
            detail: None,
            recorded_at: Utc::now(),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Transactional store over orders, payments and the saga log
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Atomically persist a new order together with its first payment.
    async fn insert_checkout(&self, order: &Order, payment: &Payment) -> EngineResult<()>;

    /// Persist an additional payment for an existing order.
    ///
    /// Fails if the order already has a payment awaiting an outcome.
    async fn insert_payment(&self, payment: &Payment) -> EngineResult<()>;

    async fn get_order(&self, order_id: Uuid) -> EngineResult<Option<Order>>;

    async fn get_payment(&self, payment_id: Uuid) -> EngineResult<Option<Payment>>;

    async fn find_payment_by_transaction(&self, transaction_id: &str)
        -> EngineResult<Option<Payment>>;

    async fn payments_for_order(&self, order_id: Uuid) -> EngineResult<Vec<Payment>>;

    /// A user's orders, newest first, optionally narrowed to one status.
    async fn orders_for_user(
        &self,
        user_id: &str,
        status: Option<OrderStatus>,
    ) -> EngineResult<Vec<Order>>;

    /// Payments across a user's orders, newest first.
    async fn payments_for_user(
        &self,
        user_id: &str,
        status: Option<PaymentStatus>,
    ) -> EngineResult<Vec<Payment>>;

    /// Versioned write; returns the stored record with its new version.
    async fn update_order(&self, order: &Order) -> EngineResult<Order>;

    /// Versioned write; returns the stored record with its new version.
    async fn update_payment(&self, payment: &Payment) -> EngineResult<Payment>;

    async fn append_saga_step(&self, step: SagaStep) -> EngineResult<()>;

    async fn saga_steps(&self) -> EngineResult<Vec<SagaStep>>;
}

#[derive(Debug, Default)]
struct StoreState {
    orders: HashMap<Uuid, Order>,
    payments: HashMap<Uuid, Payment>,
    by_transaction: HashMap<String, Uuid>,
    saga: Vec<SagaStep>,
}

impl StoreState {
    fn ensure_no_in_flight_payment(&self, order_id: Uuid) -> EngineResult<()> {
        let busy = self
            .payments
            .values()
            .any(|p| p.order_id == order_id && p.status.is_in_flight());
        if busy {
            return Err(EngineError::Validation(format!(
                "Order {} already has an active payment",
                order_id
            )));
        }
        Ok(())
    }

    fn index_transaction(&mut self, payment: &Payment) -> EngineResult<()> {
        if let Some(tid) = &payment.transaction_id {
            match self.by_transaction.get(tid) {
                Some(owner) if *owner != payment.id => {
                    return Err(EngineError::Internal(format!(
                        "Transaction {} already belongs to payment {}",
                        tid, owner
                    )));
                }
                _ => {
                    self.by_transaction.insert(tid.clone(), payment.id);
                }
            }
        }
        Ok(())
    }
}

/// In-process store; one lock over all tables keeps multi-row writes atomic
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: RwLock<StoreState>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OrderStore for InMemoryStore {
    async fn insert_checkout(&self, order: &Order, payment: &Payment) -> EngineResult<()> {
        if payment.order_id != order.id {
            return Err(EngineError::Internal(
                "Payment does not reference the order being inserted".to_string(),
            ));
        }

        let mut state = self.state.write().await;
        if state.orders.contains_key(&order.id) || state.payments.contains_key(&payment.id) {
            return Err(EngineError::Internal(format!(
                "Duplicate checkout insert for order {}",
                order.id
            )));
        }

        state.index_transaction(payment)?;
        state.orders.insert(order.id, order.clone());
        state.payments.insert(payment.id, payment.clone());
        Ok(())
    }

    async fn insert_payment(&self, payment: &Payment) -> EngineResult<()> {
        let mut state = self.state.write().await;
        if !state.orders.contains_key(&payment.order_id) {
            return Err(EngineError::OrderNotFound {
                order_id: payment.order_id,
            });
        }
        if state.payments.contains_key(&payment.id) {
            return Err(EngineError::Internal(format!(
                "Duplicate payment insert {}",
                payment.id
            )));
        }
        state.ensure_no_in_flight_payment(payment.order_id)?;
        state.index_transaction(payment)?;
        state.payments.insert(payment.id, payment.clone());
        Ok(())
    }

    async fn get_order(&self, order_id: Uuid) -> EngineResult<Option<Order>> {
        Ok(self.state.read().await.orders.get(&order_id).cloned())
    }

    async fn get_payment(&self, payment_id: Uuid) -> EngineResult<Option<Payment>> {
        Ok(self.state.read().await.payments.get(&payment_id).cloned())
    }

    async fn find_payment_by_transaction(
        &self,
        transaction_id: &str,
    ) -> EngineResult<Option<Payment>> {
        let state = self.state.read().await;
        Ok(state
            .by_transaction
            .get(transaction_id)
            .and_then(|id| state.payments.get(id))
            .cloned())
    }

    async fn payments_for_order(&self, order_id: Uuid) -> EngineResult<Vec<Payment>> {
        let state = self.state.read().await;
        let mut payments: Vec<Payment> = state
            .payments
            .values()
            .filter(|p| p.order_id == order_id)
            .cloned()
            .collect();
        payments.sort_by_key(|p| p.created_at);
        Ok(payments)
    }

    async fn orders_for_user(
        &self,
        user_id: &str,
        status: Option<OrderStatus>,
    ) -> EngineResult<Vec<Order>> {
        let state = self.state.read().await;
        let mut orders: Vec<Order> = state
            .orders
            .values()
            .filter(|o| o.user_id == user_id && status.map_or(true, |s| o.status == s))
            .cloned()
            .collect();
        orders.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(orders)
    }

    async fn payments_for_user(
        &self,
        user_id: &str,
        status: Option<PaymentStatus>,
    ) -> EngineResult<Vec<Payment>> {
        let state = self.state.read().await;
        let mut payments: Vec<Payment> = state
            .payments
            .values()
            .filter(|p| status.map_or(true, |s| p.status == s))
            .filter(|p| {
                state
                    .orders
                    .get(&p.order_id)
                    .is_some_and(|o| o.user_id == user_id)
            })
            .cloned()
            .collect();
        payments.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(payments)
    }

    async fn update_order(&self, order: &Order) -> EngineResult<Order> {
        let mut state = self.state.write().await;
        let stored = state
            .orders
            .get_mut(&order.id)
            .ok_or(EngineError::OrderNotFound { order_id: order.id })?;

        if stored.version != order.version {
            return Err(EngineError::Conflict {
                entity: "order",
                id: order.id,
            });
        }

        let mut next = order.clone();
        next.version = order.version + 1;
        next.updated_at = Utc::now();
        *stored = next.clone();
        Ok(next)
    }

    async fn update_payment(&self, payment: &Payment) -> EngineResult<Payment> {
        let mut state = self.state.write().await;
        let stored = state
            .payments
            .get(&payment.id)
            .ok_or(EngineError::PaymentNotFound {
                payment_id: payment.id,
            })?;

        if stored.version != payment.version {
            return Err(EngineError::Conflict {
                entity: "payment",
                id: payment.id,
            });
        }

        if let (Some(old), Some(new)) = (&stored.transaction_id, &payment.transaction_id) {
            if old != new {
                return Err(EngineError::Internal(format!(
                    "Transaction id of payment {} is immutable",
                    payment.id
                )));
            }
        }

        state.index_transaction(payment)?;

        let mut next = payment.clone();
        next.version = payment.version + 1;
        next.updated_at = Utc::now();
        state.payments.insert(next.id, next.clone());
        Ok(next)
    }

    async fn append_saga_step(&self, step: SagaStep) -> EngineResult<()> {
        self.state.write().await.saga.push(step);
        Ok(())
    }

    async fn saga_steps(&self) -> EngineResult<Vec<SagaStep>> {
        Ok(self.state.read().await.saga.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Product;
    use crate::money::{Amount, Currency};
    use crate::order::OrderItem;
    use crate::payment::ProviderKind;

    fn order() -> Order {
        order_for("user-1")
    }

    fn order_for(user_id: &str) -> Order {
        let product = Product::new("p1", "Product 1", Amount::from_minor(1_000));
        Order::new(user_id, vec![OrderItem::from_product(&product, 1).unwrap()], "").unwrap()
    }

    fn payment_for(order: &Order) -> Payment {
        Payment::new(order.id, ProviderKind::Stripe, order.total, Currency::USD)
    }

    #[tokio::test]
    async fn test_versioned_update_detects_conflict() {
        let store = InMemoryStore::new();
        let order = order();
        let payment = payment_for(&order);
        store.insert_checkout(&order, &payment).await.unwrap();

        let mut first = store.get_payment(payment.id).await.unwrap().unwrap();
        let mut second = first.clone();

        first.transition(PaymentStatus::Processing).unwrap();
        let saved = store.update_payment(&first).await.unwrap();
        assert_eq!(saved.version, 1);

        second.transition(PaymentStatus::Failed).unwrap();
        assert!(matches!(
            store.update_payment(&second).await,
            Err(EngineError::Conflict { entity: "payment", .. })
        ));
    }

    #[tokio::test]
    async fn test_transaction_index_and_immutability() {
        let store = InMemoryStore::new();
        let order = order();
        let payment = payment_for(&order);
        store.insert_checkout(&order, &payment).await.unwrap();

        let mut p = store.get_payment(payment.id).await.unwrap().unwrap();
        p.assign_transaction_id("pi_abc").unwrap();
        let p = store.update_payment(&p).await.unwrap();

        let found = store.find_payment_by_transaction("pi_abc").await.unwrap().unwrap();
        assert_eq!(found.id, payment.id);

        let mut tampered = p.clone();
        tampered.transaction_id = Some("pi_other".into());
        assert!(store.update_payment(&tampered).await.is_err());
    }

    #[tokio::test]
    async fn test_single_in_flight_payment_per_order() {
        let store = InMemoryStore::new();
        let order = order();
        let payment = payment_for(&order);
        store.insert_checkout(&order, &payment).await.unwrap();

        let second = payment_for(&order);
        assert!(matches!(
            store.insert_payment(&second).await,
            Err(EngineError::Validation(_))
        ));

        let mut first = store.get_payment(payment.id).await.unwrap().unwrap();
        first.transition(PaymentStatus::Failed).unwrap();
        store.update_payment(&first).await.unwrap();

        store.insert_payment(&second).await.unwrap();
        assert_eq!(store.payments_for_order(order.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_user_listings_are_scoped_and_filtered() {
        let store = InMemoryStore::new();

        let pending = order_for("alice");
        store.insert_checkout(&pending, &payment_for(&pending)).await.unwrap();

        let paid = order_for("alice");
        let paid_payment = payment_for(&paid);
        store.insert_checkout(&paid, &paid_payment).await.unwrap();
        let mut o = store.get_order(paid.id).await.unwrap().unwrap();
        o.transition(OrderStatus::Paid).unwrap();
        store.update_order(&o).await.unwrap();
        let mut p = store.get_payment(paid_payment.id).await.unwrap().unwrap();
        p.transition(PaymentStatus::Succeeded).unwrap();
        store.update_payment(&p).await.unwrap();

        let other = order_for("bob");
        store.insert_checkout(&other, &payment_for(&other)).await.unwrap();

        assert_eq!(store.orders_for_user("alice", None).await.unwrap().len(), 2);
        let only_paid = store
            .orders_for_user("alice", Some(OrderStatus::Paid))
            .await
            .unwrap();
        assert_eq!(only_paid.len(), 1);
        assert_eq!(only_paid[0].id, paid.id);
        assert!(store.orders_for_user("carol", None).await.unwrap().is_empty());

        assert_eq!(store.payments_for_user("alice", None).await.unwrap().len(), 2);
        let settled = store
            .payments_for_user("alice", Some(PaymentStatus::Succeeded))
            .await
            .unwrap();
        assert_eq!(settled.len(), 1);
        assert_eq!(settled[0].id, paid_payment.id);
        assert_eq!(store.payments_for_user("bob", None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_saga_log_is_ordered() {
        let store = InMemoryStore::new();
        let attempt = Uuid::new_v4();
        let order_id = Uuid::new_v4();

        store
            .append_saga_step(SagaStep::new(attempt, order_id, SagaStepKind::Started))
            .await
            .unwrap();
        store
            .append_saga_step(
                SagaStep::new(attempt, order_id, SagaStepKind::Compensated).with_detail("boom"),
            )
            .await
            .unwrap();

        let steps = store.saga_steps().await.unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].kind, SagaStepKind::Started);
        assert_eq!(steps[1].detail.as_deref(), Some("boom"));
    }
}
