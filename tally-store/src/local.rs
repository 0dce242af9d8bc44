use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use tally_core::{
    LogStore, OrderGuard, OrderStore, ProductStore, StockAdjustment, StoreError, StoreResult,
};
use tally_shared::{AdminActionLog, MessageLog, Order, ProductStock, StockDelta};

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    orders: HashMap<Uuid, Order>,
    products: HashMap<Uuid, ProductStock>,
    receipts: HashMap<Uuid, Vec<u8>>,
    message_logs: Vec<MessageLog>,
    admin_actions: Vec<AdminActionLog>,
}

/// Single-process store. Every operation runs under one lock, which is what
/// makes `adjust_stock` and `swap_order` atomic here. With a snapshot path the
/// whole state is rewritten to disk after each mutation, giving a file-backed
/// fallback for deployments without Postgres.
pub struct LocalStore {
    state: Mutex<Snapshot>,
    snapshot_path: Option<PathBuf>,
}

impl LocalStore {
    pub fn in_memory() -> Self {
        Self {
            state: Mutex::new(Snapshot::default()),
            snapshot_path: None,
        }
    }

    /// Open (or create) a snapshot-backed store at `path`.
    pub async fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let snapshot = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Snapshot::default(),
            Err(e) => return Err(StoreError::Backend(format!("read {}: {}", path.display(), e))),
        };

        info!(
            "Local store opened at {} ({} orders, {} products)",
            path.display(),
            snapshot.orders.len(),
            snapshot.products.len()
        );

        Ok(Self {
            state: Mutex::new(snapshot),
            snapshot_path: Some(path),
        })
    }

    /// Write-then-rename so a crash never leaves a torn snapshot. Called with the lock held.
    async fn persist(&self, state: &Snapshot) -> StoreResult<()> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| StoreError::Backend(e.to_string()))?;
            }
        }

        let bytes = serde_json::to_vec(state)?;
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        debug!("Snapshot written to {}", path.display());
        Ok(())
    }
}

impl Default for LocalStore {
    fn default() -> Self {
        Self::in_memory()
    }
}

#[async_trait]
impl OrderStore for LocalStore {
    async fn insert_order(&self, order: &Order) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        if state.orders.contains_key(&order.id) {
            return Err(StoreError::Duplicate(order.id.to_string()));
        }
        state.orders.insert(order.id, order.clone());
        self.persist(&state).await
    }

    async fn get_order(&self, id: Uuid) -> StoreResult<Option<Order>> {
        let state = self.state.lock().await;
        Ok(state.orders.get(&id).cloned())
    }

    async fn list_orders(&self, customer_id: &str) -> StoreResult<Vec<Order>> {
        let state = self.state.lock().await;
        let mut orders: Vec<Order> = state
            .orders
            .values()
            .filter(|o| o.customer.id == customer_id)
            .cloned()
            .collect();
        orders.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(orders)
    }

    async fn swap_order(&self, guard: &OrderGuard, next: &Order) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        let current = state
            .orders
            .get(&guard.order_id)
            .ok_or_else(|| StoreError::NotFound(guard.order_id.to_string()))?;

        if !guard.matches(current) {
            return Ok(false);
        }

        state.orders.insert(next.id, next.clone());
        self.persist(&state).await?;
        Ok(true)
    }

    async fn put_receipt(&self, order_id: Uuid, bytes: Vec<u8>) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state.receipts.insert(order_id, bytes);
        self.persist(&state).await
    }

    async fn get_receipt(&self, order_id: Uuid) -> StoreResult<Option<Vec<u8>>> {
        let state = self.state.lock().await;
        Ok(state.receipts.get(&order_id).cloned())
    }
}

#[async_trait]
impl ProductStore for LocalStore {
    async fn insert_product(&self, product: &ProductStock) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        if state.products.contains_key(&product.product_id) {
            return Err(StoreError::Duplicate(product.product_id.to_string()));
        }
        state.products.insert(product.product_id, product.clone());
        self.persist(&state).await
    }

    async fn get_product(&self, id: Uuid) -> StoreResult<Option<ProductStock>> {
        let state = self.state.lock().await;
        Ok(state.products.get(&id).cloned())
    }

    async fn adjust_stock(&self, product_id: Uuid, delta: StockDelta) -> StoreResult<StockAdjustment> {
        let mut state = self.state.lock().await;
        let product = state
            .products
            .get_mut(&product_id)
            .ok_or_else(|| StoreError::NotFound(product_id.to_string()))?;

        if !product.admits(delta) {
            return Ok(StockAdjustment::Refused(product.clone()));
        }

        product.stock += delta.stock;
        product.reserved_stock += delta.reserved;
        product.updated_at = chrono::Utc::now();
        let updated = product.clone();

        self.persist(&state).await?;
        Ok(StockAdjustment::Applied(updated))
    }
}

#[async_trait]
impl LogStore for LocalStore {
    async fn append_message_log(&self, entry: &MessageLog) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state.message_logs.push(entry.clone());
        self.persist(&state).await
    }

    async fn message_logs_for_job(&self, job_id: Uuid) -> StoreResult<Vec<MessageLog>> {
        let state = self.state.lock().await;
        Ok(state
            .message_logs
            .iter()
            .filter(|l| l.job_id == job_id)
            .cloned()
            .collect())
    }

    async fn append_admin_action(&self, entry: &AdminActionLog) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state.admin_actions.push(entry.clone());
        self.persist(&state).await
    }

    async fn admin_actions_for_order(&self, order_id: Uuid) -> StoreResult<Vec<AdminActionLog>> {
        let state = self.state.lock().await;
        Ok(state
            .admin_actions
            .iter()
            .filter(|l| l.order_id == order_id)
            .cloned()
            .collect())
    }
}
