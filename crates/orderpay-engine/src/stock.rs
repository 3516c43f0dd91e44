//! # Stock Ledger
//!
//! Two-phase stock accounting: `reserve` takes units out of the available
//! count with a compare-and-swap, `finalize` makes the deduction permanent,
//! `release` puts the units back.
//!
//! Each product has its own pair of atomic counters, so concurrent checkouts
//! on one product serialize on that product only. Reservations are grouped by
//! checkout attempt (the payment id) and every attempt has its own lock:
//! settling one payment never touches another attempt's units, even on the
//! same order. Attempts whose reservations are all released or restocked are
//! dropped from the index.
//!
//! A reservation that is neither finalized nor released before `expires_at`
//! is returned by [`StockLedger::release_expired`].
//!
//! ```text
//! held ──finalize──▶ finalized ──restock──▶ restocked
//!  │  ╲
//!  │   ╲──expire──▶ expired ──finalize (reclaim)──▶ finalized
//!  │                   │
//!  └──release──▶ released ◀──release──┘
//! ```

use orderpay_core::{EngineError, EngineResult, Product};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Per-product counters
#[derive(Debug, Default)]
struct ProductStock {
    available: AtomicU64,
    reserved: AtomicU64,
}

impl ProductStock {
    fn new(available: u64) -> Self {
        Self {
            available: AtomicU64::new(available),
            reserved: AtomicU64::new(0),
        }
    }

    /// Decrement `available` by `qty` where `available >= qty`.
    ///
    /// Returns the count observed on failure.
    fn try_take(&self, qty: u64) -> Result<(), u64> {
        let mut current = self.available.load(Ordering::Acquire);
        loop {
            if current < qty {
                return Err(current);
            }
            match self.available.compare_exchange_weak(
                current,
                current - qty,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    fn put_back(&self, qty: u64) {
        self.available.fetch_add(qty, Ordering::AcqRel);
    }

    fn unhold(&self, qty: u64) {
        let _ = self
            .reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |r| Some(r.saturating_sub(qty)));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationState {
    /// Units are held against the product
    Held,
    /// Deduction is permanent
    Finalized,
    /// Units went back to stock (payment failed, order cancelled, ...)
    Released,
    /// The sweep returned the units; a late success may still reclaim them
    Expired,
    /// Finalized units were put back after a refund
    Restocked,
}

impl ReservationState {
    /// Still waiting for the attempt's outcome
    fn is_open(&self) -> bool {
        matches!(self, ReservationState::Held | ReservationState::Expired)
    }

    /// Nothing left to finalize, release or restock
    fn is_closed(&self) -> bool {
        matches!(self, ReservationState::Released | ReservationState::Restocked)
    }
}

/// A provisional hold against a product's stock
#[derive(Debug, Clone)]
pub struct Reservation {
    pub id: Uuid,
    /// Checkout attempt (payment) that owns the units
    pub attempt_id: Uuid,
    pub order_id: Uuid,
    pub product_id: String,
    pub quantity: u32,
    pub state: ReservationState,
    pub expires_at: Instant,
}

/// Result of finalizing one reservation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalizeOutcome {
    Finalized,
    /// Expired, but the units were still there to take back
    Reclaimed,
    /// Expired and the units are gone
    Shortfall { product_id: String, missing: u32 },
    /// Already finalized or restocked
    AlreadyFinalized,
    /// Released before it could be finalized
    AlreadyReleased,
}

/// Aggregate of finalizing every open reservation of an attempt
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttemptFinalization {
    pub finalized_units: u64,
    pub reclaimed_units: u64,
    pub shortfalls: Vec<(String, u32)>,
}

impl AttemptFinalization {
    pub fn has_shortfall(&self) -> bool {
        !self.shortfalls.is_empty()
    }
}


struct Entry {
    reservation: Reservation,
    stock: Arc<ProductStock>,
}

impl Entry {
    fn finalize(&mut self) -> FinalizeOutcome {
        let qty = u64::from(self.reservation.quantity);
        match self.reservation.state {
            ReservationState::Held => {
                self.stock.unhold(qty);
                self.reservation.state = ReservationState::Finalized;
                FinalizeOutcome::Finalized
            }
            ReservationState::Expired => match self.stock.try_take(qty) {
                Ok(()) => {
                    self.reservation.state = ReservationState::Finalized;
                    FinalizeOutcome::Reclaimed
                }
                Err(available) => {
                    // Units are gone; close the reservation so it is never reclaimed twice
                    self.reservation.state = ReservationState::Released;
                    FinalizeOutcome::Shortfall {
                        product_id: self.reservation.product_id.clone(),
                        missing: self
                            .reservation
                            .quantity
                            .saturating_sub(u32::try_from(available).unwrap_or(u32::MAX)),
                    }
                }
            },
            ReservationState::Finalized | ReservationState::Restocked => {
                FinalizeOutcome::AlreadyFinalized
            }
            ReservationState::Released => FinalizeOutcome::AlreadyReleased,
        }
    }

    /// Returns true if units went back to stock
    fn release(&mut self) -> bool {
        let qty = u64::from(self.reservation.quantity);
        match self.reservation.state {
            ReservationState::Held => {
                self.stock.unhold(qty);
                self.stock.put_back(qty);
                self.reservation.state = ReservationState::Released;
                true
            }
            ReservationState::Expired => {
                // Units already went back at expiry; only close it
                self.reservation.state = ReservationState::Released;
                false
            }
            _ => false,
        }
    }
}

/// Reservations of one checkout attempt
type AttemptEntries = Arc<Mutex<Vec<Entry>>>;

/// Atomic reservation and release of product inventory
///
/// Lock order: the attempt index before an attempt's entries, never the
/// other way round.
pub struct StockLedger {
    products: RwLock<HashMap<String, Arc<ProductStock>>>,
    attempts: RwLock<HashMap<Uuid, AttemptEntries>>,
    ttl: Duration,
}

impl StockLedger {
    pub fn new(ttl: Duration) -> Self {
        Self {
            products: RwLock::new(HashMap::new()),
            attempts: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Start tracking a catalog product at its seed stock.
    ///
    /// Products already tracked keep their live counters.
    pub async fn track(&self, product: &Product) {
        let mut products = self.products.write().await;
        products
            .entry(product.id.clone())
            .or_insert_with(|| Arc::new(ProductStock::new(product.stock)));
    }

    /// Overwrite the available count (admin restock, tests)
    pub async fn set_stock(&self, product_id: &str, available: u64) {
        let mut products = self.products.write().await;
        match products.get(product_id) {
            Some(stock) => stock.available.store(available, Ordering::Release),
            None => {
                products.insert(product_id.to_string(), Arc::new(ProductStock::new(available)));
            }
        }
    }

    pub async fn available(&self, product_id: &str) -> u64 {
        self.products
            .read()
            .await
            .get(product_id)
            .map(|s| s.available.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Units currently held by unfinalized reservations
    pub async fn reserved(&self, product_id: &str) -> u64 {
        self.products
            .read()
            .await
            .get(product_id)
            .map(|s| s.reserved.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Hold `quantity` units of `product_id` for checkout attempt `attempt_id`.
    #[instrument(skip(self), fields(attempt_id = %attempt_id, order_id = %order_id))]
    pub async fn reserve(
        &self,
        attempt_id: Uuid,
        order_id: Uuid,
        product_id: &str,
        quantity: u32,
    ) -> EngineResult<Reservation> {
        if quantity == 0 {
            return Err(EngineError::Validation(
                "Reservation quantity must be positive".to_string(),
            ));
        }

        let stock = self.products.read().await.get(product_id).cloned();
        let stock = match stock {
            Some(stock) => stock,
            None => {
                return Err(EngineError::InsufficientStock {
                    product_id: product_id.to_string(),
                    requested: quantity,
                    available: 0,
                })
            }
        };

        stock
            .try_take(u64::from(quantity))
            .map_err(|available| EngineError::InsufficientStock {
                product_id: product_id.to_string(),
                requested: quantity,
                available,
            })?;
        stock.reserved.fetch_add(u64::from(quantity), Ordering::AcqRel);

        let reservation = Reservation {
            id: Uuid::new_v4(),
            attempt_id,
            order_id,
            product_id: product_id.to_string(),
            quantity,
            state: ReservationState::Held,
            expires_at: Instant::now() + self.ttl,
        };

        let entries = self
            .attempts
            .write()
            .await
            .entry(attempt_id)
            .or_default()
            .clone();
        entries.lock().await.push(Entry {
            reservation: reservation.clone(),
            stock,
        });

        debug!(
            reservation_id = %reservation.id,
            product_id = %product_id,
            quantity = quantity,
            "Reserved stock"
        );

        Ok(reservation)
    }

    async fn entries(&self, attempt_id: Uuid) -> Option<AttemptEntries> {
        self.attempts.read().await.get(&attempt_id).cloned()
    }

    /// Drop an attempt from the index once nothing in it can change again.
    async fn prune(&self, attempt_id: Uuid) {
        let mut attempts = self.attempts.write().await;
        let closed = match attempts.get(&attempt_id) {
            Some(entries) => entries
                .lock()
                .await
                .iter()
                .all(|e| e.reservation.state.is_closed()),
            None => false,
        };
        if closed {
            attempts.remove(&attempt_id);
            debug!(attempt_id = %attempt_id, "Pruned closed reservations");
        }
    }

    /// Finalize every open reservation of one checkout attempt. Idempotent.
    #[instrument(skip(self), fields(attempt_id = %attempt_id))]
    pub async fn finalize_attempt(&self, attempt_id: Uuid) -> AttemptFinalization {
        let mut summary = AttemptFinalization::default();
        let Some(entries) = self.entries(attempt_id).await else {
            warn!("No reservations to finalize");
            return summary;
        };

        let mut closed = true;
        for entry in entries.lock().await.iter_mut() {
            let qty = u64::from(entry.reservation.quantity);
            if entry.reservation.state.is_open() {
                match entry.finalize() {
                    FinalizeOutcome::Finalized => summary.finalized_units += qty,
                    FinalizeOutcome::Reclaimed => {
                        summary.finalized_units += qty;
                        summary.reclaimed_units += qty;
                    }
                    FinalizeOutcome::Shortfall {
                        product_id,
                        missing,
                    } => {
                        error!(
                            product_id = %product_id,
                            missing = missing,
                            "Stock shortfall while finalizing expired reservation"
                        );
                        summary.shortfalls.push((product_id, missing));
                    }
                    FinalizeOutcome::AlreadyFinalized | FinalizeOutcome::AlreadyReleased => {}
                }
            }
            closed &= entry.reservation.state.is_closed();
        }

        if closed {
            self.prune(attempt_id).await;
        }

        info!(
            finalized_units = summary.finalized_units,
            reclaimed_units = summary.reclaimed_units,
            "Finalized attempt stock"
        );
        summary
    }

    /// Release every open reservation of one checkout attempt. Returns units put back.
    #[instrument(skip(self), fields(attempt_id = %attempt_id))]
    pub async fn release_attempt(&self, attempt_id: Uuid) -> u64 {
        let Some(entries) = self.entries(attempt_id).await else {
            return 0;
        };

        let mut released = 0;
        let mut closed = true;
        for entry in entries.lock().await.iter_mut() {
            if entry.release() {
                released += u64::from(entry.reservation.quantity);
            }
            closed &= entry.reservation.state.is_closed();
        }

        if closed {
            self.prune(attempt_id).await;
        }
        if released > 0 {
            info!(units = released, "Released attempt stock");
        }
        released
    }

    /// Put an attempt's finalized units back into stock, once per reservation.
    #[instrument(skip(self), fields(attempt_id = %attempt_id))]
    pub async fn restock_attempt(&self, attempt_id: Uuid) -> u64 {
        let Some(entries) = self.entries(attempt_id).await else {
            return 0;
        };

        let mut restocked = 0;
        let mut closed = true;
        for entry in entries.lock().await.iter_mut() {
            if entry.reservation.state == ReservationState::Finalized {
                let qty = u64::from(entry.reservation.quantity);
                entry.stock.put_back(qty);
                entry.reservation.state = ReservationState::Restocked;
                restocked += qty;
            }
            closed &= entry.reservation.state.is_closed();
        }

        if closed {
            self.prune(attempt_id).await;
        }
        info!(units = restocked, "Restocked attempt items");
        restocked
    }

    /// Return held units whose reservation outlived its TTL.
    #[instrument(skip(self))]
    pub async fn release_expired(&self) -> usize {
        let now = Instant::now();
        let attempts: Vec<AttemptEntries> = self.attempts.read().await.values().cloned().collect();

        let mut expired = 0;
        for entries in attempts {
            for entry in entries.lock().await.iter_mut().filter(|e| {
                e.reservation.state == ReservationState::Held && e.reservation.expires_at <= now
            }) {
                let qty = u64::from(entry.reservation.quantity);
                entry.stock.unhold(qty);
                entry.stock.put_back(qty);
                entry.reservation.state = ReservationState::Expired;
                expired += 1;

                warn!(
                    reservation_id = %entry.reservation.id,
                    attempt_id = %entry.reservation.attempt_id,
                    order_id = %entry.reservation.order_id,
                    product_id = %entry.reservation.product_id,
                    "Reservation expired"
                );
            }
        }

        info!(expired_count = expired, "Completed expired reservation sweep");
        expired
    }

    /// Reservations of an attempt still tracked by the ledger
    pub async fn reservations_for_attempt(&self, attempt_id: Uuid) -> Vec<Reservation> {
        match self.entries(attempt_id).await {
            Some(entries) => entries
                .lock()
                .await
                .iter()
                .map(|e| e.reservation.clone())
                .collect(),
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orderpay_core::Amount;

    async fn ledger_with(product_id: &str, stock: u64) -> StockLedger {
        let ledger = StockLedger::new(Duration::from_secs(60));
        ledger
            .track(&Product::new(product_id, "Widget", Amount::from_minor(100)).with_stock(stock))
            .await;
        ledger
    }

    #[tokio::test]
    async fn test_reserve_and_finalize() {
        let ledger = ledger_with("p1", 5).await;
        let attempt = Uuid::new_v4();

        ledger.reserve(attempt, Uuid::new_v4(), "p1", 3).await.unwrap();
        assert_eq!(ledger.available("p1").await, 2);
        assert_eq!(ledger.reserved("p1").await, 3);

        let summary = ledger.finalize_attempt(attempt).await;
        assert_eq!(summary.finalized_units, 3);
        assert_eq!(ledger.available("p1").await, 2);
        assert_eq!(ledger.reserved("p1").await, 0);

        assert_eq!(ledger.finalize_attempt(attempt).await.finalized_units, 0);
        assert_eq!(ledger.release_attempt(attempt).await, 0);
        assert_eq!(ledger.available("p1").await, 2);
    }

    #[tokio::test]
    async fn test_insufficient_stock_reports_available() {
        let ledger = ledger_with("p1", 2).await;
        let err = ledger
            .reserve(Uuid::new_v4(), Uuid::new_v4(), "p1", 3)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::InsufficientStock {
                requested: 3,
                available: 2,
                ..
            }
        ));
        assert_eq!(ledger.available("p1").await, 2);
    }

    #[tokio::test]
    async fn test_untracked_product_has_no_stock() {
        let ledger = StockLedger::new(Duration::from_secs(60));
        assert!(ledger
            .reserve(Uuid::new_v4(), Uuid::new_v4(), "ghost", 1)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_release_is_idempotent_and_prunes() {
        let ledger = ledger_with("p1", 4).await;
        let attempt = Uuid::new_v4();
        let order_id = Uuid::new_v4();
        ledger.reserve(attempt, order_id, "p1", 1).await.unwrap();
        ledger.reserve(attempt, order_id, "p1", 2).await.unwrap();
        assert_eq!(ledger.reservations_for_attempt(attempt).await.len(), 2);

        assert_eq!(ledger.release_attempt(attempt).await, 3);
        assert_eq!(ledger.release_attempt(attempt).await, 0);
        assert_eq!(ledger.available("p1").await, 4);
        assert_eq!(ledger.reserved("p1").await, 0);
        assert!(ledger.reservations_for_attempt(attempt).await.is_empty());
    }

    #[tokio::test]
    async fn test_attempts_of_one_order_are_isolated() {
        let ledger = ledger_with("p1", 10).await;
        let order_id = Uuid::new_v4();
        let failed = Uuid::new_v4();
        let retry = Uuid::new_v4();

        ledger.reserve(failed, order_id, "p1", 2).await.unwrap();
        ledger.reserve(retry, order_id, "p1", 2).await.unwrap();
        assert_eq!(ledger.available("p1").await, 6);

        // Releasing the failed attempt leaves the retry's hold in place
        assert_eq!(ledger.release_attempt(failed).await, 2);
        assert_eq!(ledger.available("p1").await, 8);
        assert_eq!(ledger.reserved("p1").await, 2);

        assert_eq!(ledger.finalize_attempt(retry).await.finalized_units, 2);
        assert_eq!(ledger.available("p1").await, 8);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_reservations_never_oversell() {
        let ledger = Arc::new(ledger_with("hot", 10).await);

        let handles: Vec<_> = (0..50)
            .map(|_| {
                let ledger = Arc::clone(&ledger);
                tokio::spawn(async move {
                    ledger
                        .reserve(Uuid::new_v4(), Uuid::new_v4(), "hot", 1)
                        .await
                        .is_ok()
                })
            })
            .collect();

        let mut won = 0;
        for handle in handles {
            if handle.await.unwrap() {
                won += 1;
            }
        }

        assert_eq!(won, 10);
        assert_eq!(ledger.available("hot").await, 0);
        assert_eq!(ledger.reserved("hot").await, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_and_reclaim() {
        let ledger = ledger_with("p1", 2).await;
        let attempt = Uuid::new_v4();
        ledger.reserve(attempt, Uuid::new_v4(), "p1", 2).await.unwrap();

        assert_eq!(ledger.release_expired().await, 0);
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(ledger.release_expired().await, 1);
        assert_eq!(ledger.available("p1").await, 2);

        let summary = ledger.finalize_attempt(attempt).await;
        assert_eq!(summary.reclaimed_units, 2);
        assert!(!summary.has_shortfall());
        assert_eq!(ledger.available("p1").await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reclaim_shortfall_after_resale() {
        let ledger = ledger_with("p1", 1).await;
        let slow = Uuid::new_v4();
        ledger.reserve(slow, Uuid::new_v4(), "p1", 1).await.unwrap();

        tokio::time::advance(Duration::from_secs(61)).await;
        ledger.release_expired().await;

        let fast = Uuid::new_v4();
        ledger.reserve(fast, Uuid::new_v4(), "p1", 1).await.unwrap();
        ledger.finalize_attempt(fast).await;

        let summary = ledger.finalize_attempt(slow).await;
        assert_eq!(summary.shortfalls, vec![("p1".to_string(), 1)]);
        assert_eq!(ledger.available("p1").await, 0);

        // Closed: a second delivery does not try again
        let again = ledger.finalize_attempt(slow).await;
        assert!(!again.has_shortfall());
        assert!(ledger.reservations_for_attempt(slow).await.is_empty());
    }

    #[tokio::test]
    async fn test_restock_happens_once() {
        let ledger = ledger_with("p1", 3).await;
        let attempt = Uuid::new_v4();
        ledger.reserve(attempt, Uuid::new_v4(), "p1", 2).await.unwrap();
        ledger.finalize_attempt(attempt).await;

        assert_eq!(ledger.restock_attempt(attempt).await, 2);
        assert_eq!(ledger.restock_attempt(attempt).await, 0);
        assert_eq!(ledger.available("p1").await, 3);
        assert!(ledger.reservations_for_attempt(attempt).await.is_empty());
    }
}
