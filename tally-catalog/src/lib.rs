pub mod inventory;

pub use inventory::{LedgerError, StockLedger, StockShortfall};
