//! Read-modify-write helpers over the versioned store.
//!
//! The closure sees a fresh copy of the record on every attempt and returns
//! `Ok(None)` when no write is needed. A version conflict reloads and tries
//! again, up to the configured retry budget.

use orderpay_core::{EngineError, EngineResult, Order, OrderStore, Payment};
use std::future::Future;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

pub(crate) async fn mutate_payment<T>(
    store: &dyn OrderStore,
    payment_id: Uuid,
    max_retries: u32,
    mut apply: impl FnMut(&mut Payment) -> EngineResult<Option<T>>,
) -> EngineResult<(Payment, Option<T>)> {
    for attempt in 0..=max_retries {
        let current = store
            .get_payment(payment_id)
            .await?
            .ok_or(EngineError::PaymentNotFound { payment_id })?;

        let mut draft = current.clone();
        let Some(value) = apply(&mut draft)? else {
            return Ok((current, None));
        };

        match store.update_payment(&draft).await {
            Ok(saved) => return Ok((saved, Some(value))),
            Err(EngineError::Conflict { .. }) => {
                debug!(payment_id = %payment_id, attempt = attempt, "Payment write conflict, retrying");
            }
            Err(e) => return Err(e),
        }
    }

    Err(EngineError::Conflict {
        entity: "payment",
        id: payment_id,
    })
}

pub(crate) async fn mutate_order<T>(
    store: &dyn OrderStore,
    order_id: Uuid,
    max_retries: u32,
    mut apply: impl FnMut(&mut Order) -> EngineResult<Option<T>>,
) -> EngineResult<(Order, Option<T>)> {
    for attempt in 0..=max_retries {
        let current = store
            .get_order(order_id)
            .await?
            .ok_or(EngineError::OrderNotFound { order_id })?;

        let mut draft = current.clone();
        let Some(value) = apply(&mut draft)? else {
            return Ok((current, None));
        };

        match store.update_order(&draft).await {
            Ok(saved) => return Ok((saved, Some(value))),
            Err(EngineError::Conflict { .. }) => {
                debug!(order_id = %order_id, attempt = attempt, "Order write conflict, retrying");
            }
            Err(e) => return Err(e),
        }
    }

    Err(EngineError::Conflict {
        entity: "order",
        id: order_id,
    })
}

/// Run an outbound provider call under the engine's time budget.
pub(crate) async fn with_provider_timeout<T>(
    provider: &str,
    budget: Duration,
    call: impl Future<Output = EngineResult<T>>,
) -> EngineResult<T> {
    match tokio::time::timeout(budget, call).await {
        Ok(result) => result,
        Err(_) => Err(EngineError::ProviderTimeout {
            provider: provider.to_string(),
            timeout_ms: u64::try_from(budget.as_millis()).unwrap_or(u64::MAX),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orderpay_core::{
        Amount, Currency, InMemoryStore, OrderItem, PaymentStatus, Product, ProviderKind,
    };

    async fn seeded() -> (InMemoryStore, Payment) {
        let store = InMemoryStore::new();
        let product = Product::new("p1", "P", Amount::from_minor(100));
        let order =
            Order::new("u", vec![OrderItem::from_product(&product, 1).unwrap()], "").unwrap();
        let payment = Payment::new(order.id, ProviderKind::Stripe, order.total, Currency::USD);
        store.insert_checkout(&order, &payment).await.unwrap();
        (store, payment)
    }

    #[tokio::test]
    async fn test_no_write_when_closure_declines() {
        let (store, payment) = seeded().await;
        let (current, changed) = mutate_payment(&store, payment.id, 3, |_| Ok(None::<()>))
            .await
            .unwrap();
        assert!(changed.is_none());
        assert_eq!(current.version, 0);
    }

    #[tokio::test]
    async fn test_write_bumps_version() {
        let (store, payment) = seeded().await;
        let (saved, _) = mutate_payment(&store, payment.id, 3, |p| {
            p.transition(PaymentStatus::Processing)?;
            Ok(Some(()))
        })
        .await
        .unwrap();
        assert_eq!(saved.version, 1);
        assert_eq!(saved.status, PaymentStatus::Processing);
    }

    #[tokio::test]
    async fn test_closure_error_propagates() {
        let (store, payment) = seeded().await;
        let result = mutate_payment(&store, payment.id, 3, |p| {
            p.transition(PaymentStatus::Refunded)?;
            Ok(Some(()))
        })
        .await;
        assert!(matches!(result, Err(EngineError::Validation(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_provider_timeout() {
        let slow = async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, EngineError>(())
        };
        let err = with_provider_timeout("stripe", Duration::from_secs(5), slow)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::ProviderTimeout { timeout_ms: 5_000, .. }
        ));
    }
}
