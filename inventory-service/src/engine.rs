use std::sync::Arc;

use shared::LineItem;
use uuid::Uuid;

use crate::catalog::{PgStockCounter, StockCounter};
use crate::error::{ReleaseError, ReserveError};
use crate::ledger::{PgReservationLedger, ReservationLedger};
use crate::models::Reservation;
use crate::release::{ReleaseService, ReleaseSummary};
use crate::reservation::ReservationService;
use crate::DbPool;

/// The contract offered to the order workflow.
#[derive(Clone)]
pub struct StockEngine {
    reservations: ReservationService,
    releases: ReleaseService,
}

impl StockEngine {
    pub fn new(counter: Arc<dyn StockCounter>, ledger: Arc<dyn ReservationLedger>) -> Self {
        Self {
            reservations: ReservationService::new(Arc::clone(&counter), Arc::clone(&ledger)),
            releases: ReleaseService::new(counter, ledger),
        }
    }

    pub fn postgres(pool: DbPool) -> Self {
        Self::new(
            Arc::new(PgStockCounter::new(pool.clone())),
            Arc::new(PgReservationLedger::new(pool)),
        )
    }

    pub async fn reserve_stock(&self, order_id: Uuid, items: &[LineItem]) -> Result<Vec<Reservation>, ReserveError> {
        self.reservations.reserve(order_id, items).await
    }

    pub async fn release_stock(&self, order_id: Uuid) -> Result<ReleaseSummary, ReleaseError> {
        self.releases.release(order_id).await
    }

    pub async fn cancel_reservation(&self, order_id: Uuid) -> Result<ReleaseSummary, ReleaseError> {
        self.releases.cancel(order_id).await
    }
}
