use shared::FailureReason;
use thiserror::Error;
use uuid::Uuid;

/// Infrastructure failures. Always retryable from the caller's side.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),

    #[error("connection pool error: {0}")]
    Pool(String),

    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("reservation {id} has unknown status '{status}'")]
    CorruptStatus { id: Uuid, status: String },

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, Error)]
pub enum ReserveError {
    #[error("no line items to reserve")]
    EmptyItems,

    #[error("invalid quantity {quantity} for variant {variant_id}")]
    InvalidQuantity { variant_id: Uuid, quantity: i32 },

    #[error("variant not found: {0:?}")]
    VariantNotFound(Vec<Uuid>),

    #[error("insufficient stock for variant {variant_id}: requested {requested}")]
    InsufficientStock { variant_id: Uuid, requested: i32 },

    #[error(transparent)]
    Infrastructure(#[from] StorageError),
}

impl ReserveError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ReserveError::Infrastructure(_))
    }

    pub fn reason(&self) -> FailureReason {
        match self {
            ReserveError::EmptyItems | ReserveError::InvalidQuantity { .. } => FailureReason::InvalidRequest,
            ReserveError::VariantNotFound(_) => FailureReason::VariantNotFound,
            ReserveError::InsufficientStock { .. } => FailureReason::InsufficientStock,
            ReserveError::Infrastructure(_) => FailureReason::Infrastructure,
        }
    }
}

#[derive(Debug, Error)]
pub enum ReleaseError {
    #[error("no reservations found for order {0}")]
    NoReservationsFound(Uuid),

    #[error("no reserved stock found for order {0}")]
    NoReservedStockFound(Uuid),

    #[error("variant {0} vanished while returning stock")]
    VariantNotFound(Uuid),

    #[error(transparent)]
    Infrastructure(#[from] StorageError),
}

impl ReleaseError {
    /// A vanished variant leaves its row held, so a retry may succeed once the
    /// catalog is repaired.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ReleaseError::Infrastructure(_) | ReleaseError::VariantNotFound(_))
    }

    pub fn reason(&self) -> FailureReason {
        match self {
            ReleaseError::NoReservationsFound(_) => FailureReason::NoReservationsFound,
            ReleaseError::NoReservedStockFound(_) => FailureReason::NoReservedStockFound,
            ReleaseError::VariantNotFound(_) => FailureReason::VariantNotFound,
            ReleaseError::Infrastructure(_) => FailureReason::Infrastructure,
        }
    }
}
