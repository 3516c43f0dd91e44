//! # Order Builder
//!
//! Turns a cart into a priced `Order` and holds stock for every line,
//! all-or-nothing.

use crate::stock::{Reservation, StockLedger};
use orderpay_core::{CartItem, Catalog, EngineError, EngineResult, Order, OrderItem};
use std::sync::Arc;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

/// A freshly priced order plus the reservations taken for it
#[derive(Debug, Clone)]
pub struct BuiltOrder {
    pub order: Order,
    /// Checkout attempt owning the reservations; becomes the payment id
    pub attempt_id: Uuid,
    pub reservations: Vec<Reservation>,
}

/// Validates a cart against the catalog and reserves its stock
#[derive(Clone)]
pub struct OrderBuilder {
    catalog: Arc<dyn Catalog>,
    ledger: Arc<StockLedger>,
    max_cart_lines: usize,
}

impl OrderBuilder {
    pub fn new(catalog: Arc<dyn Catalog>, ledger: Arc<StockLedger>, max_cart_lines: usize) -> Self {
        Self {
            catalog,
            ledger,
            max_cart_lines,
        }
    }

    /// Merge duplicate product lines and check quantities.
    ///
    /// Lines keep the order in which each product first appears.
    pub fn normalize_cart(&self, cart: &[CartItem]) -> EngineResult<Vec<(String, u32)>> {
        if cart.is_empty() {
            return Err(EngineError::Validation("Cart is empty".to_string()));
        }

        let mut lines: Vec<(String, u32)> = Vec::with_capacity(cart.len());
        for item in cart {
            if item.product_id.trim().is_empty() {
                return Err(EngineError::Validation(
                    "Cart item has no product id".to_string(),
                ));
            }
            if item.quantity <= 0 {
                return Err(EngineError::Validation(format!(
                    "Quantity for {} must be a positive integer, got {}",
                    item.product_id, item.quantity
                )));
            }
            let quantity = u32::try_from(item.quantity).map_err(|_| {
                EngineError::Validation(format!("Quantity for {} is too large", item.product_id))
            })?;

            match lines.iter_mut().find(|(id, _)| *id == item.product_id) {
                Some((_, existing)) => {
                    *existing = existing.checked_add(quantity).ok_or_else(|| {
                        EngineError::Validation(format!(
                            "Quantity for {} is too large",
                            item.product_id
                        ))
                    })?;
                }
                None => lines.push((item.product_id.clone(), quantity)),
            }
        }

        if lines.len() > self.max_cart_lines {
            return Err(EngineError::Validation(format!(
                "Cart has {} lines, at most {} allowed",
                lines.len(),
                self.max_cart_lines
            )));
        }

        Ok(lines)
    }

    /// Price the cart at current catalog prices and reserve its stock.
    ///
    /// On any failure every reservation taken in this call is released and
    /// nothing is returned.
    #[instrument(skip(self, cart, notes), fields(lines = cart.len()))]
    pub async fn build(
        &self,
        user_id: &str,
        cart: &[CartItem],
        notes: &str,
    ) -> EngineResult<BuiltOrder> {
        if user_id.trim().is_empty() {
            return Err(EngineError::Validation("User id is required".to_string()));
        }

        let lines = self.normalize_cart(cart)?;

        let mut items = Vec::with_capacity(lines.len());
        for (product_id, quantity) in lines {
            let product = self
                .catalog
                .get_product(&product_id)
                .await?
                .ok_or_else(|| EngineError::ProductNotFound {
                    product_id: product_id.clone(),
                })?;

            if !product.is_purchasable() {
                return Err(EngineError::ProductUnavailable { product_id });
            }

            self.ledger.track(&product).await;
            items.push(OrderItem::from_product(&product, quantity)?);
        }

        let order = Order::new(user_id, items, notes)?;
        let attempt_id = Uuid::new_v4();
        let reservations = self.reserve_items(attempt_id, order.id, &order.items).await?;

        debug!(
            order_id = %order.id,
            attempt_id = %attempt_id,
            total = %order.total,
            "Built order"
        );

        Ok(BuiltOrder {
            order,
            attempt_id,
            reservations,
        })
    }

    /// Reserve every item of an order for one checkout attempt, rolling
    /// back on the first failure.
    pub async fn reserve_items(
        &self,
        attempt_id: Uuid,
        order_id: Uuid,
        items: &[OrderItem],
    ) -> EngineResult<Vec<Reservation>> {
        let mut taken: Vec<Reservation> = Vec::with_capacity(items.len());

        for item in items {
            match self
                .ledger
                .reserve(attempt_id, order_id, &item.product_id, item.quantity)
                .await
            {
                Ok(reservation) => taken.push(reservation),
                Err(e) => {
                    warn!(
                        order_id = %order_id,
                        product_id = %item.product_id,
                        error = %e,
                        "Reservation failed, rolling back"
                    );
                    self.ledger.release_attempt(attempt_id).await;
                    return Err(e);
                }
            }
        }

        Ok(taken)
    }
}
