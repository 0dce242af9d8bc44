use async_trait::async_trait;
use crate::error::StoreResult;

/// Fixed-window limiter consulted before accepting an upload.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Count one attempt against `key`. Returns `false` once the window's allowance is spent.
    async fn check(&self, key: &str) -> StoreResult<bool>;
}
