use async_trait::async_trait;
use uuid::Uuid;
use tally_shared::{AdminActionLog, MessageLog, Order, OrderStatus, ProductStock, StockDelta};

use crate::error::StoreResult;

/// What the caller last saw of an order. A swap only lands if the stored
/// document still matches, which serializes same-order transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderGuard {
    pub order_id: Uuid,
    pub status: OrderStatus,
    pub approval_token: Option<String>,
    pub rejection_token: Option<String>,
}

impl OrderGuard {
    pub fn of(order: &Order) -> Self {
        Self {
            order_id: order.id,
            status: order.status,
            approval_token: order.approval_token.clone(),
            rejection_token: order.rejection_token.clone(),
        }
    }

    pub fn matches(&self, order: &Order) -> bool {
        order.id == self.order_id
            && order.status == self.status
            && order.approval_token == self.approval_token
            && order.rejection_token == self.rejection_token
    }
}

/// Result of the conditional counter update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StockAdjustment {
    /// The delta was applied; carries the counters after the update.
    Applied(ProductStock),
    /// The delta would have broken `0 <= reserved <= stock`; carries the untouched counters.
    Refused(ProductStock),
}

/// Repository trait for order documents
#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn insert_order(&self, order: &Order) -> StoreResult<()>;

    async fn get_order(&self, id: Uuid) -> StoreResult<Option<Order>>;

    async fn list_orders(&self, customer_id: &str) -> StoreResult<Vec<Order>>;

    /// Compare-and-swap: replace the stored order with `next` only if it still
    /// matches `guard`. Returns `false` when another writer got there first.
    async fn swap_order(&self, guard: &OrderGuard, next: &Order) -> StoreResult<bool>;

    async fn put_receipt(&self, order_id: Uuid, bytes: Vec<u8>) -> StoreResult<()>;

    async fn get_receipt(&self, order_id: Uuid) -> StoreResult<Option<Vec<u8>>>;
}

/// Repository trait for product inventory counters
#[async_trait]
pub trait ProductStore: Send + Sync {
    async fn insert_product(&self, product: &ProductStock) -> StoreResult<()>;

    async fn get_product(&self, id: Uuid) -> StoreResult<Option<ProductStock>>;

    /// The only mutation of stock counters. Applies `delta` to `stock` and
    /// `reserved_stock` in one atomic step, and only if the result keeps
    /// `0 <= reserved_stock <= stock`. Unknown products are `NotFound`.
    async fn adjust_stock(&self, product_id: Uuid, delta: StockDelta) -> StoreResult<StockAdjustment>;
}

/// Append-only audit and delivery logs
#[async_trait]
pub trait LogStore: Send + Sync {
    async fn append_message_log(&self, entry: &MessageLog) -> StoreResult<()>;

    async fn message_logs_for_job(&self, job_id: Uuid) -> StoreResult<Vec<MessageLog>>;

    async fn append_admin_action(&self, entry: &AdminActionLog) -> StoreResult<()>;

    async fn admin_actions_for_order(&self, order_id: Uuid) -> StoreResult<Vec<AdminActionLog>>;
}

/// The uniform persistence surface handed to the core. One implementation is
/// chosen at startup; nothing downstream knows which.
pub trait Store: OrderStore + ProductStore + LogStore {}

impl<T: OrderStore + ProductStore + LogStore> Store for T {}
