//! Reservation ledger: the source of truth for what is currently held.

use async_trait::async_trait;
use chrono::Utc;
use diesel::prelude::*;
use diesel_async::RunQueryDsl;
use uuid::Uuid;

use crate::error::{StorageError, StorageResult};
use crate::models::{Reservation, ReservationRecord, ReservationStatus};
use crate::schema::reservations;
use crate::DbPool;

#[async_trait]
pub trait ReservationLedger: Send + Sync {
    /// Persists every row or none of them.
    async fn insert_many(&self, reservations: Vec<Reservation>) -> StorageResult<Vec<Reservation>>;

    /// All rows for the order regardless of status, oldest first.
    async fn find_by_order(&self, order_id: Uuid) -> StorageResult<Vec<Reservation>>;

    /// Moves every row of the order currently in `from` to `to`. Returns the
    /// number of rows changed.
    async fn set_status_by_order(
        &self,
        order_id: Uuid,
        to: ReservationStatus,
        from: ReservationStatus,
    ) -> StorageResult<usize>;

    /// Same guarded transition, restricted to the given row ids.
    async fn set_status_by_ids(
        &self,
        ids: &[Uuid],
        to: ReservationStatus,
        from: ReservationStatus,
    ) -> StorageResult<usize>;
}

pub struct PgReservationLedger {
    pool: DbPool,
}

impl PgReservationLedger {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ReservationLedger for PgReservationLedger {
    async fn insert_many(&self, reservations: Vec<Reservation>) -> StorageResult<Vec<Reservation>> {
        if reservations.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.pool.get().await.map_err(|e| StorageError::Pool(e.to_string()))?;

        let records: Vec<ReservationRecord> = reservations.iter().map(ReservationRecord::from).collect();

        // One multi-row INSERT is a single statement, so it is all-or-nothing.
        let inserted = diesel::insert_into(reservations::table)
            .values(&records)
            .returning(ReservationRecord::as_returning())
            .get_results::<ReservationRecord>(&mut conn)
            .await?;

        inserted.into_iter().map(Reservation::try_from).collect()
    }

    async fn find_by_order(&self, order_id: Uuid) -> StorageResult<Vec<Reservation>> {
        let mut conn = self.pool.get().await.map_err(|e| StorageError::Pool(e.to_string()))?;

        let records = reservations::table
            .filter(reservations::order_id.eq(order_id))
            .order((reservations::created_at.asc(), reservations::id.asc()))
            .select(ReservationRecord::as_select())
            .load::<ReservationRecord>(&mut conn)
            .await?;

        records.into_iter().map(Reservation::try_from).collect()
    }

    async fn set_status_by_order(
        &self,
        order_id: Uuid,
        to: ReservationStatus,
        from: ReservationStatus,
    ) -> StorageResult<usize> {
        let mut conn = self.pool.get().await.map_err(|e| StorageError::Pool(e.to_string()))?;

        let changed = diesel::update(
            reservations::table
                .filter(reservations::order_id.eq(order_id))
                .filter(reservations::status.eq(from.as_str())),
        )
        .set((
            reservations::status.eq(to.as_str()),
            reservations::updated_at.eq(Utc::now()),
        ))
        .execute(&mut conn)
        .await?;

        Ok(changed)
    }

    async fn set_status_by_ids(
        &self,
        ids: &[Uuid],
        to: ReservationStatus,
        from: ReservationStatus,
    ) -> StorageResult<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.pool.get().await.map_err(|e| StorageError::Pool(e.to_string()))?;

        let changed = diesel::update(
            reservations::table
                .filter(reservations::id.eq_any(ids))
                .filter(reservations::status.eq(from.as_str())),
        )
        .set((
            reservations::status.eq(to.as_str()),
            reservations::updated_at.eq(Utc::now()),
        ))
        .execute(&mut conn)
        .await?;

        Ok(changed)
    }
}
