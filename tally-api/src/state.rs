use prometheus::Registry;
use std::sync::Arc;

use tally_core::{RateLimiter, Store};
use tally_notify::NotificationDispatcher;
use tally_order::OrderStateMachine;

#[derive(Clone)]
pub struct AuthConfig {
    pub secret: String,
    pub expiration: u64,
}

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub orders: Arc<OrderStateMachine>,
    pub dispatcher: Arc<NotificationDispatcher>,
    /// Consulted before every receipt upload
    pub upload_limiter: Arc<dyn RateLimiter>,
    /// Request body cap for receipt uploads; the receipt policy enforces the file limit.
    pub upload_body_limit: usize,
    pub auth: AuthConfig,
    pub registry: Registry,
}
