use std::sync::Arc;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};
use uuid::Uuid;

use tally_core::{StockAdjustment, Store, StoreError};
use tally_shared::{ProductStock, StockDelta, StockLine};

/// A line that cannot be satisfied from what is currently available.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StockShortfall {
    pub product_id: Uuid,
    pub product_name: String,
    pub requested: i64,
    pub available: i64,
}

impl StockShortfall {
    pub fn deficit(&self) -> i64 {
        self.requested - self.available
    }
}

/// Stock counters per product. Every mutation goes through the store's
/// conditional `adjust_stock`, so concurrent callers never observe
/// `reserved_stock > stock` and never race on a read-then-write.
pub struct StockLedger {
    store: Arc<dyn Store>,
}

impl StockLedger {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Hold units for an unconfirmed order. All-or-nothing: if any line does
    /// not fit, the lines already reserved by this call are released again.
    pub async fn reserve_stock(&self, lines: &[StockLine]) -> Result<(), LedgerError> {
        self.apply_all(lines, StockDelta::reserve, |line, current| LedgerError::InsufficientStock {
            product_id: line.product_id,
            product_name: current.name.clone(),
            requested: line.quantity,
            available: current.available(),
            deficit: line.quantity - current.available(),
        })
        .await
    }

    /// Final sale: the reserved units leave both `stock` and `reserved_stock`.
    pub async fn decrement_stock(&self, lines: &[StockLine]) -> Result<(), LedgerError> {
        self.apply_all(lines, StockDelta::commit, |line, current| LedgerError::ReservationMissing {
            product_id: line.product_id,
            requested: line.quantity,
            reserved: current.reserved_stock,
        })
        .await
    }

    /// Hand reserved units back to the sellable pool.
    pub async fn release_stock(&self, lines: &[StockLine]) -> Result<(), LedgerError> {
        self.apply_all(lines, StockDelta::release, |line, current| LedgerError::ReservationMissing {
            product_id: line.product_id,
            requested: line.quantity,
            reserved: current.reserved_stock,
        })
        .await
    }

    /// Put sold units back on the shelf (`stock` only). Undoes a decrement
    /// whose order could not be saved.
    pub async fn restock(&self, lines: &[StockLine]) -> Result<(), LedgerError> {
        self.apply_all(
            lines,
            |q| StockDelta { stock: q, reserved: 0 },
            |line, current| LedgerError::ReservationMissing {
                product_id: line.product_id,
                requested: line.quantity,
                reserved: current.reserved_stock,
            },
        )
        .await
    }

    /// Read-only: the lines whose available quantity is insufficient.
    pub async fn check_stock(&self, lines: &[StockLine]) -> Result<Vec<StockShortfall>, LedgerError> {
        let mut shortfalls = Vec::new();

        for line in lines {
            validate_line(line)?;
            let product = self
                .store
                .get_product(line.product_id)
                .await?
                .ok_or(LedgerError::UnknownProduct(line.product_id))?;

            if product.available() < line.quantity {
                shortfalls.push(StockShortfall {
                    product_id: line.product_id,
                    product_name: product.name.clone(),
                    requested: line.quantity,
                    available: product.available(),
                });
            }
        }

        Ok(shortfalls)
    }

    /// Get current counters for a product
    pub async fn get(&self, product_id: Uuid) -> Result<Option<ProductStock>, LedgerError> {
        Ok(self.store.get_product(product_id).await?)
    }

    async fn apply_all<D, R>(&self, lines: &[StockLine], delta_for: D, refused: R) -> Result<(), LedgerError>
    where
        D: Fn(i64) -> StockDelta,
        R: Fn(&StockLine, &ProductStock) -> LedgerError,
    {
        for line in lines {
            validate_line(line)?;
        }

        let mut applied: Vec<(Uuid, StockDelta)> = Vec::with_capacity(lines.len());

        for line in lines {
            let delta = delta_for(line.quantity);
            let outcome = match self.store.adjust_stock(line.product_id, delta).await {
                Ok(outcome) => outcome,
                Err(StoreError::NotFound(_)) => {
                    self.roll_back(&applied).await;
                    return Err(LedgerError::UnknownProduct(line.product_id));
                }
                Err(e) => {
                    self.roll_back(&applied).await;
                    return Err(e.into());
                }
            };

            match outcome {
                StockAdjustment::Applied(p) => {
                    debug!(
                        "Stock {} {:+}/{:+} -> stock={} reserved={}",
                        p.product_id, delta.stock, delta.reserved, p.stock, p.reserved_stock
                    );
                    applied.push((line.product_id, delta));
                }
                StockAdjustment::Refused(current) => {
                    self.roll_back(&applied).await;
                    let err = refused(line, &current);
                    warn!("Stock adjustment refused: {}", err);
                    return Err(err);
                }
            }
        }

        Ok(())
    }

    /// Undo the adjustments already made by a failed multi-line call, newest first.
    async fn roll_back(&self, applied: &[(Uuid, StockDelta)]) {
        for (product_id, delta) in applied.iter().rev() {
            match self.store.adjust_stock(*product_id, delta.inverse()).await {
                Ok(StockAdjustment::Applied(_)) => {}
                Ok(StockAdjustment::Refused(p)) => {
                    error!(
                        "Rollback refused for product {} (stock={} reserved={})",
                        product_id, p.stock, p.reserved_stock
                    );
                }
                Err(e) => error!("Rollback failed for product {}: {}", product_id, e),
            }
        }
    }
}

fn validate_line(line: &StockLine) -> Result<(), LedgerError> {
    if line.quantity <= 0 {
        return Err(LedgerError::InvalidQuantity {
            product_id: line.product_id,
            quantity: line.quantity,
        });
    }
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("Insufficient stock for {product_name}: requested {requested}, available {available} (short by {deficit})")]
    InsufficientStock {
        product_id: Uuid,
        product_name: String,
        requested: i64,
        available: i64,
        deficit: i64,
    },

    #[error("Product not found: {0}")]
    UnknownProduct(Uuid),

    #[error("Quantity must be positive for product {product_id}, got {quantity}")]
    InvalidQuantity {
        product_id: Uuid,
        quantity: i64,
    },

    #[error("Reservation missing for product {product_id}: requested {requested}, reserved {reserved}")]
    ReservationMissing {
        product_id: Uuid,
        requested: i64,
        reserved: i64,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}
