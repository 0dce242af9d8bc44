use serde::{Deserialize, Serialize};
use uuid::Uuid;
use chrono::{DateTime, Utc};

/// Inventory view of a product.
///
/// Invariant: `0 <= reserved_stock <= stock`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProductStock {
    pub product_id: Uuid,
    pub name: String,
    /// Catalog price in minor units; orders copy it at checkout.
    pub price: i64,
    pub stock: i64,
    pub reserved_stock: i64,
    pub updated_at: DateTime<Utc>,
}

impl ProductStock {
    pub fn new(product_id: Uuid, name: impl Into<String>, price: i64, stock: i64) -> Self {
        Self {
            product_id,
            name: name.into(),
            price,
            stock,
            reserved_stock: 0,
            updated_at: Utc::now(),
        }
    }

    /// Units that can still be reserved.
    pub fn available(&self) -> i64 {
        self.stock - self.reserved_stock
    }

    /// Whether applying `delta` keeps the counters inside their invariant.
    /// A delta that would overflow either counter is never admitted.
    pub fn admits(&self, delta: StockDelta) -> bool {
        match (
            self.stock.checked_add(delta.stock),
            self.reserved_stock.checked_add(delta.reserved),
        ) {
            (Some(stock), Some(reserved)) => stock >= 0 && reserved >= 0 && reserved <= stock,
            _ => false,
        }
    }
}

/// A product reference paired with the number of units involved.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct StockLine {
    pub product_id: Uuid,
    pub quantity: i64,
}

/// Signed change applied to both counters of a product in one step.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct StockDelta {
    pub stock: i64,
    pub reserved: i64,
}

impl StockDelta {
    pub fn reserve(quantity: i64) -> Self {
        Self { stock: 0, reserved: quantity }
    }

    pub fn release(quantity: i64) -> Self {
        Self { stock: 0, reserved: -quantity }
    }

    /// Final sale: the units leave both counters.
    pub fn commit(quantity: i64) -> Self {
        Self { stock: -quantity, reserved: -quantity }
    }

    pub fn inverse(&self) -> Self {
        Self { stock: -self.stock, reserved: -self.reserved }
    }
}
