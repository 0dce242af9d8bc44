pub mod app_config;
pub mod local;
pub mod postgres;
pub mod rate_limit;

pub use local::LocalStore;
pub use postgres::PgStore;
pub use rate_limit::{MemoryRateLimiter, RedisRateLimiter};
