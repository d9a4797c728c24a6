//! In-process stock counter and ledger.
//!
//! Used for embedding the engine without Postgres and for exercising the
//! compensation paths, which need failures on demand.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::catalog::StockCounter;
use crate::error::{StorageError, StorageResult};
use crate::ledger::ReservationLedger;
use crate::models::{AdjustOutcome, Reservation, ReservationStatus, StockLevel};

/// Stock counter with one mutex per variant. The mutex is held only across
/// the check-and-write of a single adjustment.
#[derive(Default)]
pub struct InMemoryStockCounter {
    variants: RwLock<HashMap<Uuid, Arc<Mutex<i32>>>>,
    failing_increments: RwLock<HashSet<Uuid>>,
}

impl InMemoryStockCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stock(stock: impl IntoIterator<Item = (Uuid, i32)>) -> Self {
        let variants = stock
            .into_iter()
            .map(|(id, qty)| (id, Arc::new(Mutex::new(qty))))
            .collect();
        Self {
            variants: RwLock::new(variants),
            failing_increments: RwLock::new(HashSet::new()),
        }
    }

    pub async fn remove(&self, variant_id: Uuid) {
        self.variants.write().await.remove(&variant_id);
    }

    pub async fn stock(&self, variant_id: Uuid) -> Option<i32> {
        let counter = self.variants.read().await.get(&variant_id).cloned()?;
        let stock = *counter.lock().await;
        Some(stock)
    }

    /// Makes positive adjustments of `variant_id` fail as if the store were down.
    pub async fn set_fail_increments(&self, variant_id: Uuid, fail: bool) {
        let mut failing = self.failing_increments.write().await;
        if fail {
            failing.insert(variant_id);
        } else {
            failing.remove(&variant_id);
        }
    }
}

#[async_trait]
impl StockCounter for InMemoryStockCounter {
    async fn get_stock_and_exists(&self, variant_ids: &[Uuid]) -> StorageResult<HashMap<Uuid, StockLevel>> {
        let mut levels = HashMap::with_capacity(variant_ids.len());
        for id in variant_ids {
            let level = match self.stock(*id).await {
                Some(stock) => StockLevel::present(stock),
                None => StockLevel::MISSING,
            };
            levels.insert(*id, level);
        }
        Ok(levels)
    }

    async fn adjust_stock(&self, variant_id: Uuid, delta: i32) -> StorageResult<AdjustOutcome> {
        if delta > 0 && self.failing_increments.read().await.contains(&variant_id) {
            return Err(StorageError::Unavailable(format!("stock counter for {}", variant_id)));
        }

        let counter = match self.variants.read().await.get(&variant_id) {
            Some(counter) => Arc::clone(counter),
            None => return Ok(AdjustOutcome::NotFound),
        };

        let mut stock = counter.lock().await;
        match stock.checked_add(delta) {
            Some(next) if next >= 0 => {
                *stock = next;
                Ok(AdjustOutcome::Applied)
            }
            Some(_) => Ok(AdjustOutcome::InsufficientStock),
            None => Err(StorageError::Unavailable(format!("stock counter overflow for {}", variant_id))),
        }
    }
}

#[derive(Default)]
pub struct InMemoryLedger {
    rows: RwLock<Vec<Reservation>>,
    fail_on_insert: RwLock<bool>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_fail_on_insert(&self, fail: bool) {
        *self.fail_on_insert.write().await = fail;
    }

    pub async fn rows(&self) -> Vec<Reservation> {
        self.rows.read().await.clone()
    }
}

#[async_trait]
impl ReservationLedger for InMemoryLedger {
    async fn insert_many(&self, reservations: Vec<Reservation>) -> StorageResult<Vec<Reservation>> {
        if *self.fail_on_insert.read().await {
            return Err(StorageError::Unavailable("reservation ledger".to_string()));
        }
        self.rows.write().await.extend(reservations.iter().cloned());
        Ok(reservations)
    }

    async fn find_by_order(&self, order_id: Uuid) -> StorageResult<Vec<Reservation>> {
        let rows = self.rows.read().await;
        let mut found: Vec<Reservation> = rows.iter().filter(|r| r.order_id == order_id).cloned().collect();
        // Stable sort keeps insertion order for rows created in the same batch.
        found.sort_by_key(|r| r.created_at);
        Ok(found)
    }

    async fn set_status_by_order(
        &self,
        order_id: Uuid,
        to: ReservationStatus,
        from: ReservationStatus,
    ) -> StorageResult<usize> {
        let mut rows = self.rows.write().await;
        let now = Utc::now();
        let mut changed = 0;
        for row in rows.iter_mut().filter(|r| r.order_id == order_id && r.status == from) {
            row.status = to;
            row.updated_at = now;
            changed += 1;
        }
        Ok(changed)
    }

    async fn set_status_by_ids(
        &self,
        ids: &[Uuid],
        to: ReservationStatus,
        from: ReservationStatus,
    ) -> StorageResult<usize> {
        let mut rows = self.rows.write().await;
        let now = Utc::now();
        let mut changed = 0;
        for row in rows.iter_mut().filter(|r| ids.contains(&r.id) && r.status == from) {
            row.status = to;
            row.updated_at = now;
            changed += 1;
        }
        Ok(changed)
    }
}
