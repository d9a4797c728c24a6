use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;
use chrono::{DateTime, Utc};

use crate::error::StorageError;

/// Lifecycle of a reservation row. `Held` is the only non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReservationStatus {
    Held,
    Released,
    Cancelled,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Held => "held",
            ReservationStatus::Released => "released",
            ReservationStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ReservationStatus::Held)
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReservationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "held" => Ok(ReservationStatus::Held),
            "released" => Ok(ReservationStatus::Released),
            "cancelled" => Ok(ReservationStatus::Cancelled),
            other => Err(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Uuid,
    pub order_id: Uuid,
    pub variant_id: Uuid,
    pub quantity: i32,
    pub status: ReservationStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Reservation {
    pub fn held(order_id: Uuid, variant_id: Uuid, quantity: i32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            order_id,
            variant_id,
            quantity,
            status: ReservationStatus::Held,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Row shape of the `reservations` table; status is stored as text.
#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = crate::schema::reservations)]
pub struct ReservationRecord {
    pub id: Uuid,
    pub order_id: Uuid,
    pub variant_id: Uuid,
    pub quantity: i32,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Reservation> for ReservationRecord {
    fn from(reservation: &Reservation) -> Self {
        Self {
            id: reservation.id,
            order_id: reservation.order_id,
            variant_id: reservation.variant_id,
            quantity: reservation.quantity,
            status: reservation.status.as_str().to_string(),
            created_at: reservation.created_at,
            updated_at: reservation.updated_at,
        }
    }
}

impl TryFrom<ReservationRecord> for Reservation {
    type Error = StorageError;

    fn try_from(record: ReservationRecord) -> Result<Self, Self::Error> {
        let status = record
            .status
            .parse()
            .map_err(|status| StorageError::CorruptStatus { id: record.id, status })?;
        Ok(Self {
            id: record.id,
            order_id: record.order_id,
            variant_id: record.variant_id,
            quantity: record.quantity,
            status,
            created_at: record.created_at,
            updated_at: record.updated_at,
        })
    }
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = crate::schema::variants)]
pub struct Variant {
    pub id: Uuid,
    pub stock: i32,
    pub updated_at: DateTime<Utc>,
}

/// Answer of a batch stock lookup for one requested variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StockLevel {
    pub exists: bool,
    pub stock: i32,
}

impl StockLevel {
    pub const MISSING: StockLevel = StockLevel { exists: false, stock: 0 };

    pub fn present(stock: i32) -> Self {
        Self { exists: true, stock }
    }
}

/// Result of one conditional stock mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdjustOutcome {
    Applied,
    InsufficientStock,
    NotFound,
}

#[derive(Debug, Clone, Queryable, Insertable)]
#[diesel(table_name = crate::schema::processed_commands)]
pub struct ProcessedCommand {
    pub idempotency_key: String,
    pub command_id: Uuid,
    pub reply: serde_json::Value,
    pub processed_at: DateTime<Utc>,
}
