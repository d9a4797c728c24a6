//! Reserve: claim stock for every line item of an order, or for none of them.

use std::collections::BTreeMap;
use std::sync::Arc;

use shared::LineItem;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::catalog::StockCounter;
use crate::error::{ReserveError, StorageError};
use crate::ledger::ReservationLedger;
use crate::models::{AdjustOutcome, Reservation};

#[derive(Clone)]
pub struct ReservationService {
    counter: Arc<dyn StockCounter>,
    ledger: Arc<dyn ReservationLedger>,
}

impl ReservationService {
    pub fn new(counter: Arc<dyn StockCounter>, ledger: Arc<dyn ReservationLedger>) -> Self {
        Self { counter, ledger }
    }

    /// Withdraws stock for `items` and records one held row per variant.
    ///
    /// Not idempotent: a second call for the same order adds a second claim.
    pub async fn reserve(&self, order_id: Uuid, items: &[LineItem]) -> Result<Vec<Reservation>, ReserveError> {
        let wanted = merge_line_items(items)?;
        let variant_ids: Vec<Uuid> = wanted.keys().copied().collect();

        let levels = self.counter.get_stock_and_exists(&variant_ids).await?;
        let missing: Vec<Uuid> = variant_ids
            .iter()
            .filter(|id| !levels.get(*id).map_or(false, |level| level.exists))
            .copied()
            .collect();
        if !missing.is_empty() {
            warn!(%order_id, ?missing, "Rejecting reservation for unknown variants");
            return Err(ReserveError::VariantNotFound(missing));
        }

        let counter = Arc::clone(&self.counter);
        let ledger = Arc::clone(&self.ledger);

        // Detached so that dropping the caller cannot interrupt compensation.
        tokio::spawn(async move { claim(counter.as_ref(), ledger.as_ref(), order_id, wanted).await })
            .await
            .map_err(StorageError::from)?
    }
}

/// Validates quantities and folds repeated variants into one entry. The map
/// iterates in ascending variant id, which is the decrement order.
pub fn merge_line_items(items: &[LineItem]) -> Result<BTreeMap<Uuid, i32>, ReserveError> {
    if items.is_empty() {
        return Err(ReserveError::EmptyItems);
    }

    let mut wanted = BTreeMap::new();
    for item in items {
        if item.quantity <= 0 {
            return Err(ReserveError::InvalidQuantity {
                variant_id: item.variant_id,
                quantity: item.quantity,
            });
        }
        let total: &mut i32 = wanted.entry(item.variant_id).or_insert(0);
        *total = total.checked_add(item.quantity).ok_or(ReserveError::InvalidQuantity {
            variant_id: item.variant_id,
            quantity: item.quantity,
        })?;
    }
    Ok(wanted)
}

async fn claim(
    counter: &dyn StockCounter,
    ledger: &dyn ReservationLedger,
    order_id: Uuid,
    wanted: BTreeMap<Uuid, i32>,
) -> Result<Vec<Reservation>, ReserveError> {
    let mut applied: Vec<(Uuid, i32)> = Vec::with_capacity(wanted.len());

    for (&variant_id, &quantity) in &wanted {
        let failure = match counter.adjust_stock(variant_id, -quantity).await {
            Ok(AdjustOutcome::Applied) => {
                applied.push((variant_id, quantity));
                continue;
            }
            Ok(AdjustOutcome::InsufficientStock) => {
                info!(%order_id, %variant_id, quantity, "Insufficient stock");
                ReserveError::InsufficientStock { variant_id, requested: quantity }
            }
            Ok(AdjustOutcome::NotFound) => {
                warn!(%order_id, %variant_id, "Variant disappeared before decrement");
                ReserveError::VariantNotFound(vec![variant_id])
            }
            Err(e) => {
                error!(%order_id, %variant_id, "Stock decrement failed: {}", e);
                ReserveError::Infrastructure(e)
            }
        };

        compensate(counter, order_id, &applied).await;
        return Err(failure);
    }

    let rows: Vec<Reservation> = wanted
        .iter()
        .map(|(&variant_id, &quantity)| Reservation::held(order_id, variant_id, quantity))
        .collect();

    match ledger.insert_many(rows).await {
        Ok(inserted) => {
            info!(%order_id, rows = inserted.len(), "Stock reserved");
            Ok(inserted)
        }
        Err(e) => {
            error!(%order_id, "Ledger write failed after stock was withdrawn: {}", e);
            compensate(counter, order_id, &applied).await;
            Err(e.into())
        }
    }
}

/// Returns every decrement applied by this call, newest first. Anything that
/// cannot be returned is logged for the reconciliation sweep.
async fn compensate(counter: &dyn StockCounter, order_id: Uuid, applied: &[(Uuid, i32)]) {
    for &(variant_id, quantity) in applied.iter().rev() {
        match counter.adjust_stock(variant_id, quantity).await {
            Ok(AdjustOutcome::Applied) => {}
            Ok(outcome) => {
                error!(
                    target: "reconciliation",
                    %order_id, %variant_id, quantity, ?outcome,
                    "Stock withdrawn without a ledger row"
                );
            }
            Err(e) => {
                error!(
                    target: "reconciliation",
                    %order_id, %variant_id, quantity,
                    "Stock withdrawn without a ledger row: {}", e
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryLedger, InMemoryStockCounter};
    use crate::models::ReservationStatus;

    fn item(variant_id: Uuid, quantity: i32) -> LineItem {
        LineItem { variant_id, quantity }
    }

    fn service(counter: &Arc<InMemoryStockCounter>, ledger: &Arc<InMemoryLedger>) -> ReservationService {
        ReservationService::new(counter.clone(), ledger.clone())
    }

    #[test]
    fn merge_sums_repeated_variants_in_ascending_order() {
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let merged = merge_line_items(&[item(a, 2), item(b, 1), item(a, 3)]).unwrap();

        assert_eq!(merged.len(), 2);
        assert_eq!(merged[&a], 5);
        assert_eq!(merged[&b], 1);
        let keys: Vec<_> = merged.keys().copied().collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }

    #[test]
    fn merge_rejects_empty_and_non_positive() {
        assert!(matches!(merge_line_items(&[]), Err(ReserveError::EmptyItems)));
        assert!(matches!(
            merge_line_items(&[item(Uuid::new_v4(), 0)]),
            Err(ReserveError::InvalidQuantity { quantity: 0, .. })
        ));
        let v = Uuid::new_v4();
        assert!(matches!(
            merge_line_items(&[item(v, i32::MAX), item(v, 1)]),
            Err(ReserveError::InvalidQuantity { .. })
        ));
    }

    #[tokio::test]
    async fn reserve_writes_one_held_row_per_variant() {
        let v1 = Uuid::new_v4();
        let counter = Arc::new(InMemoryStockCounter::with_stock([(v1, 10)]));
        let ledger = Arc::new(InMemoryLedger::new());
        let order = Uuid::new_v4();

        let rows = service(&counter, &ledger).reserve(order, &[item(v1, 4)]).await.unwrap();

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, ReservationStatus::Held);
        assert_eq!((rows[0].order_id, rows[0].variant_id, rows[0].quantity), (order, v1, 4));
        assert_eq!(counter.stock(v1).await, Some(6));
    }

    #[tokio::test]
    async fn unknown_variant_fails_before_any_decrement() {
        let known = Uuid::new_v4();
        let unknown = Uuid::new_v4();
        let counter = Arc::new(InMemoryStockCounter::with_stock([(known, 10)]));
        let ledger = Arc::new(InMemoryLedger::new());
        let order = Uuid::new_v4();

        let err = service(&counter, &ledger)
            .reserve(order, &[item(known, 1), item(unknown, 1)])
            .await
            .unwrap_err();

        assert!(matches!(err, ReserveError::VariantNotFound(ref ids) if ids == &vec![unknown]));
        assert_eq!(counter.stock(known).await, Some(10));
        assert!(ledger.find_by_order(order).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn insufficient_stock_compensates_earlier_decrements() {
        let (mut a, mut b) = (Uuid::new_v4(), Uuid::new_v4());
        // A must be decremented first for compensation to be exercised.
        if b < a {
            std::mem::swap(&mut a, &mut b);
        }
        let counter = Arc::new(InMemoryStockCounter::with_stock([(a, 10), (b, 4)]));
        let ledger = Arc::new(InMemoryLedger::new());
        let order = Uuid::new_v4();

        let err = service(&counter, &ledger)
            .reserve(order, &[item(a, 3), item(b, 5)])
            .await
            .unwrap_err();

        assert!(matches!(err, ReserveError::InsufficientStock { variant_id, requested: 5 } if variant_id == b));
        assert_eq!(counter.stock(a).await, Some(10));
        assert_eq!(counter.stock(b).await, Some(4));
        assert!(ledger.find_by_order(order).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn ledger_failure_returns_withdrawn_stock() {
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let counter = Arc::new(InMemoryStockCounter::with_stock([(a, 5), (b, 5)]));
        let ledger = Arc::new(InMemoryLedger::new());
        ledger.set_fail_on_insert(true).await;

        let err = service(&counter, &ledger)
            .reserve(Uuid::new_v4(), &[item(a, 2), item(b, 5)])
            .await
            .unwrap_err();

        assert!(err.is_retryable());
        assert_eq!(counter.stock(a).await, Some(5));
        assert_eq!(counter.stock(b).await, Some(5));
    }

    #[tokio::test]
    async fn failed_compensation_still_reports_original_error() {
        let a = Uuid::new_v4();
        let counter = Arc::new(InMemoryStockCounter::with_stock([(a, 5)]));
        let ledger = Arc::new(InMemoryLedger::new());
        ledger.set_fail_on_insert(true).await;
        counter.set_fail_increments(a, true).await;

        let err = service(&counter, &ledger).reserve(Uuid::new_v4(), &[item(a, 2)]).await.unwrap_err();

        assert!(matches!(err, ReserveError::Infrastructure(StorageError::Unavailable(_))));
        // The un-returned units are left for reconciliation.
        assert_eq!(counter.stock(a).await, Some(3));
    }
}
