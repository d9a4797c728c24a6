//! Stock counter: the only legal way to change a variant's stock.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use diesel::prelude::*;
use diesel_async::RunQueryDsl;
use tracing::debug;
use uuid::Uuid;

use crate::error::{StorageError, StorageResult};
use crate::models::{AdjustOutcome, StockLevel, Variant};
use crate::schema::variants;
use crate::DbPool;

/// Catalog-side stock counter.
///
/// `adjust_stock` with a negative delta must check and decrement as one
/// indivisible step against the backing store. A failed decrement is
/// `AdjustOutcome::InsufficientStock`, never an error.
#[async_trait]
pub trait StockCounter: Send + Sync {
    /// Batch lookup; every requested id appears in the result.
    async fn get_stock_and_exists(&self, variant_ids: &[Uuid]) -> StorageResult<HashMap<Uuid, StockLevel>>;

    async fn adjust_stock(&self, variant_id: Uuid, delta: i32) -> StorageResult<AdjustOutcome>;
}

pub struct PgStockCounter {
    pool: DbPool,
}

impl PgStockCounter {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StockCounter for PgStockCounter {
    async fn get_stock_and_exists(&self, variant_ids: &[Uuid]) -> StorageResult<HashMap<Uuid, StockLevel>> {
        let mut conn = self.pool.get().await.map_err(|e| StorageError::Pool(e.to_string()))?;

        let found = variants::table
            .filter(variants::id.eq_any(variant_ids))
            .select(Variant::as_select())
            .load::<Variant>(&mut conn)
            .await?;

        let mut levels: HashMap<Uuid, StockLevel> =
            variant_ids.iter().map(|id| (*id, StockLevel::MISSING)).collect();
        for variant in found {
            levels.insert(variant.id, StockLevel::present(variant.stock));
        }
        Ok(levels)
    }

    async fn adjust_stock(&self, variant_id: Uuid, delta: i32) -> StorageResult<AdjustOutcome> {
        let mut conn = self.pool.get().await.map_err(|e| StorageError::Pool(e.to_string()))?;

        // The guard is part of the UPDATE itself, so Postgres evaluates it under
        // the row lock taken for the write.
        let updated = if delta < 0 {
            diesel::update(
                variants::table
                    .filter(variants::id.eq(variant_id))
                    .filter(variants::stock.ge(-delta)),
            )
            .set((
                variants::stock.eq(variants::stock + delta),
                variants::updated_at.eq(Utc::now()),
            ))
            .execute(&mut conn)
            .await?
        } else {
            diesel::update(variants::table.filter(variants::id.eq(variant_id)))
                .set((
                    variants::stock.eq(variants::stock + delta),
                    variants::updated_at.eq(Utc::now()),
                ))
                .execute(&mut conn)
                .await?
        };

        if updated == 1 {
            return Ok(AdjustOutcome::Applied);
        }

        let exists = variants::table
            .find(variant_id)
            .select(variants::id)
            .first::<Uuid>(&mut conn)
            .await
            .optional()?
            .is_some();

        debug!(%variant_id, delta, exists, "stock adjustment not applied");
        if exists {
            Ok(AdjustOutcome::InsufficientStock)
        } else {
            Ok(AdjustOutcome::NotFound)
        }
    }
}
