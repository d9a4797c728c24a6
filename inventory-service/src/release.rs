//! Release and cancel: return the stock behind an order's held rows.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::catalog::StockCounter;
use crate::error::{ReleaseError, StorageError};
use crate::ledger::ReservationLedger;
use crate::models::{AdjustOutcome, Reservation, ReservationStatus};

#[derive(Debug, Clone, Serialize)]
pub struct ReleaseSummary {
    pub order_id: Uuid,
    pub status: ReservationStatus,
    pub reservations: Vec<Reservation>,
}

/// One async mutex per order, pruned once nobody holds or waits on it.
#[derive(Default)]
struct OrderLocks {
    locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl OrderLocks {
    async fn acquire(&self, order_id: Uuid) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            Arc::clone(locks.entry(order_id).or_default())
        };
        lock.lock_owned().await
    }
}

#[derive(Clone)]
pub struct ReleaseService {
    counter: Arc<dyn StockCounter>,
    ledger: Arc<dyn ReservationLedger>,
    order_locks: Arc<OrderLocks>,
}

impl ReleaseService {
    pub fn new(counter: Arc<dyn StockCounter>, ledger: Arc<dyn ReservationLedger>) -> Self {
        Self {
            counter,
            ledger,
            order_locks: Arc::new(OrderLocks::default()),
        }
    }

    /// Returns held stock and marks the rows released. Safe to call again: a
    /// second call finds nothing held and reports `NoReservedStockFound`.
    pub async fn release(&self, order_id: Uuid) -> Result<ReleaseSummary, ReleaseError> {
        self.finish(order_id, ReservationStatus::Released).await
    }

    /// Like `release`, but the rows end up cancelled.
    pub async fn cancel(&self, order_id: Uuid) -> Result<ReleaseSummary, ReleaseError> {
        self.finish(order_id, ReservationStatus::Cancelled).await
    }

    async fn finish(&self, order_id: Uuid, target: ReservationStatus) -> Result<ReleaseSummary, ReleaseError> {
        let guard = self.order_locks.acquire(order_id).await;
        let counter = Arc::clone(&self.counter);
        let ledger = Arc::clone(&self.ledger);

        tokio::spawn(async move {
            let _guard = guard;
            return_stock(counter.as_ref(), ledger.as_ref(), order_id, target).await
        })
        .await
        .map_err(StorageError::from)?
    }
}

async fn return_stock(
    counter: &dyn StockCounter,
    ledger: &dyn ReservationLedger,
    order_id: Uuid,
    target: ReservationStatus,
) -> Result<ReleaseSummary, ReleaseError> {
    let rows = ledger.find_by_order(order_id).await?;
    if rows.is_empty() {
        return Err(ReleaseError::NoReservationsFound(order_id));
    }

    let held: Vec<Reservation> = rows
        .into_iter()
        .filter(|row| !row.status.is_terminal())
        .collect();
    if held.is_empty() {
        info!(%order_id, "Nothing held for order");
        return Err(ReleaseError::NoReservedStockFound(order_id));
    }

    let mut returned = Vec::with_capacity(held.len());
    let mut failure = None;
    for row in held {
        match counter.adjust_stock(row.variant_id, row.quantity).await {
            Ok(AdjustOutcome::Applied) => returned.push(row),
            Ok(AdjustOutcome::NotFound) => {
                warn!(%order_id, variant_id = %row.variant_id, "Cannot return stock to missing variant");
                failure = Some(ReleaseError::VariantNotFound(row.variant_id));
                break;
            }
            Ok(AdjustOutcome::InsufficientStock) => {
                error!(%order_id, variant_id = %row.variant_id, "Stock increment rejected by counter");
                failure = Some(ReleaseError::Infrastructure(StorageError::Unavailable(format!(
                    "increment of variant {} was rejected",
                    row.variant_id
                ))));
                break;
            }
            Err(e) => {
                error!(%order_id, variant_id = %row.variant_id, "Stock increment failed: {}", e);
                failure = Some(e.into());
                break;
            }
        }
    }

    // Only the rows whose stock went back; a row added after the snapshot
    // stays held.
    let ids: Vec<Uuid> = returned.iter().map(|row| row.id).collect();
    let transition = ledger
        .set_status_by_ids(&ids, target, ReservationStatus::Held)
        .await;

    match transition {
        Ok(changed) if changed != returned.len() => {
            warn!(%order_id, changed, expected = returned.len(), "Unexpected number of rows transitioned");
        }
        Ok(_) => {}
        Err(e) => {
            for row in &returned {
                error!(
                    target: "reconciliation",
                    %order_id, variant_id = %row.variant_id, quantity = row.quantity,
                    "Stock returned but row still held: {}", e
                );
            }
            return Err(e.into());
        }
    }

    if let Some(failure) = failure {
        return Err(failure);
    }

    for row in returned.iter_mut() {
        row.status = target;
    }
    info!(%order_id, rows = returned.len(), status = %target, "Stock returned");

    Ok(ReleaseSummary {
        order_id,
        status: target,
        reservations: returned,
    })
}
