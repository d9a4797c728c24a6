use serde::{Deserialize, Serialize};
use uuid::Uuid;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub id: Uuid,
    pub saga_id: Uuid,
    pub command_type: CommandType,
    pub payload: serde_json::Value,
    pub idempotency_key: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CommandType {
    ReserveStock,
    ReleaseStock,
    CancelReservation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandReply {
    pub id: Uuid,
    pub command_id: Uuid,
    pub saga_id: Uuid,
    pub status: CommandStatus,
    pub result: Option<serde_json::Value>,
    pub reason: Option<FailureReason>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CommandStatus {
    Success,
    Failed,
}

/// Why a stock command failed, as seen by the order workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    InvalidRequest,
    VariantNotFound,
    InsufficientStock,
    NoReservationsFound,
    NoReservedStockFound,
    Infrastructure,
}

impl FailureReason {
    /// Infrastructure failures are the only ones worth redelivering.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FailureReason::Infrastructure)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub variant_id: Uuid,
    pub quantity: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReserveStockData {
    pub order_id: Uuid,
    pub items: Vec<LineItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseStockData {
    pub order_id: Uuid,
}

impl Command {
    pub fn new(saga_id: Uuid, command_type: CommandType, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            saga_id,
            command_type,
            payload,
            idempotency_key: format!("{}_{}", saga_id, Uuid::new_v4()),
            created_at: Utc::now(),
        }
    }

    pub fn reserve_stock(saga_id: Uuid, data: &ReserveStockData) -> serde_json::Result<Self> {
        Ok(Self::new(saga_id, CommandType::ReserveStock, serde_json::to_value(data)?))
    }

    pub fn release_stock(saga_id: Uuid, data: &ReleaseStockData) -> serde_json::Result<Self> {
        Ok(Self::new(saga_id, CommandType::ReleaseStock, serde_json::to_value(data)?))
    }
}

impl CommandReply {
    pub fn success(command_id: Uuid, saga_id: Uuid, result: Option<serde_json::Value>) -> Self {
        Self {
            id: Uuid::new_v4(),
            command_id,
            saga_id,
            status: CommandStatus::Success,
            result,
            reason: None,
            error: None,
            created_at: Utc::now(),
        }
    }

    pub fn failed(command_id: Uuid, saga_id: Uuid, reason: FailureReason, error: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            command_id,
            saga_id,
            status: CommandStatus::Failed,
            result: None,
            reason: Some(reason),
            error: Some(error),
            created_at: Utc::now(),
        }
    }
}
