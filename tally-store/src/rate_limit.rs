use async_trait::async_trait;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::warn;

use tally_core::{RateLimiter, StoreError, StoreResult};

/// Fixed-window counter in Redis. The first hit of a window sets its expiry,
/// so the window does not slide with every attempt.
#[derive(Clone)]
pub struct RedisRateLimiter {
    client: redis::Client,
    limit: i64,
    window_seconds: i64,
}

impl RedisRateLimiter {
    pub fn new(client: redis::Client, limit: i64, window_seconds: i64) -> Self {
        Self {
            client,
            limit,
            window_seconds,
        }
    }
}

#[async_trait]
impl RateLimiter for RedisRateLimiter {
    async fn check(&self, key: &str) -> StoreResult<bool> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        let script = redis::Script::new(
            r#"
            local count = redis.call("INCR", KEYS[1])
            if count == 1 then
                redis.call("EXPIRE", KEYS[1], ARGV[1])
            end
            return count
        "#,
        );

        let count: i64 = script
            .key(format!("ratelimit:{}", key))
            .arg(self.window_seconds)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        if count > self.limit {
            warn!("Rate limit exceeded for {} ({} attempts)", key, count);
        }
        Ok(count <= self.limit)
    }
}

/// In-process fixed-window limiter for single-node deployments and tests.
pub struct MemoryRateLimiter {
    windows: Mutex<HashMap<String, (Instant, i64)>>,
    limit: i64,
    window: Duration,
}

impl MemoryRateLimiter {
    pub fn new(limit: i64, window: Duration) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            limit,
            window,
        }
    }
}

#[async_trait]
impl RateLimiter for MemoryRateLimiter {
    async fn check(&self, key: &str) -> StoreResult<bool> {
        let mut windows = self.windows.lock().await;
        let now = Instant::now();
        let entry = windows.entry(key.to_string()).or_insert((now, 0));

        if now.duration_since(entry.0) >= self.window {
            *entry = (now, 0);
        }
        entry.1 += 1;

        Ok(entry.1 <= self.limit)
    }
}
