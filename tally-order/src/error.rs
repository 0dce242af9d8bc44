use uuid::Uuid;

use tally_catalog::LedgerError;
use tally_core::StoreError;

use crate::receipt::ReceiptError;
use crate::tokens::TokenError;

#[derive(Debug, thiserror::Error)]
pub enum OrderError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Insufficient stock for {product_name}: requested {requested}, available {available} (short by {deficit})")]
    InsufficientStock {
        product_id: Uuid,
        product_name: String,
        requested: i64,
        available: i64,
        deficit: i64,
    },

    #[error(transparent)]
    Receipt(#[from] ReceiptError),

    /// Deliberately carries no detail: expired, forged and stale tokens look the same.
    #[error("Invalid or expired approval link")]
    TokenInvalid,

    #[error("Order not found: {0}")]
    NotFound(Uuid),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Persistence failure: {0}")]
    Persistence(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for OrderError {
    fn from(err: StoreError) -> Self {
        OrderError::Persistence(err.to_string())
    }
}

impl From<TokenError> for OrderError {
    fn from(err: TokenError) -> Self {
        OrderError::Internal(err.to_string())
    }
}

impl From<LedgerError> for OrderError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::InsufficientStock {
                product_id,
                product_name,
                requested,
                available,
                deficit,
            } => OrderError::InsufficientStock {
                product_id,
                product_name,
                requested,
                available,
                deficit,
            },
            LedgerError::UnknownProduct(id) => OrderError::Validation(format!("unknown product {}", id)),
            LedgerError::InvalidQuantity { product_id, quantity } => {
                OrderError::Validation(format!("quantity {} for product {} must be positive", quantity, product_id))
            }
            missing @ LedgerError::ReservationMissing { .. } => OrderError::Conflict(missing.to_string()),
            LedgerError::Store(e) => OrderError::Persistence(e.to_string()),
        }
    }
}

pub type OrderResult<T> = Result<T, OrderError>;
