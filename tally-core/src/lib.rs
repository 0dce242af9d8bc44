pub mod error;
pub mod rate_limit;
pub mod repository;

pub use error::{StoreError, StoreResult};
pub use rate_limit::RateLimiter;
pub use repository::{LogStore, OrderGuard, OrderStore, ProductStore, StockAdjustment, Store};
