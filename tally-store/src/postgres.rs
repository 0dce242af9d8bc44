use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{Pool, Postgres};
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

use tally_core::{
    LogStore, OrderGuard, OrderStore, ProductStore, StockAdjustment, StoreError, StoreResult,
};
use tally_shared::{AdminActionLog, MessageLog, Order, ProductStock, StockDelta};

/// Postgres-backed store. Orders and log entries are JSONB documents; the
/// columns next to them exist only so the guarded updates can be expressed
/// as a single `UPDATE ... WHERE`.
#[derive(Clone)]
pub struct PgStore {
    pub pool: Pool<Postgres>,
}

// Internal struct for type-safe querying
#[derive(sqlx::FromRow)]
struct ProductRow {
    id: Uuid,
    name: String,
    price: i64,
    stock: i64,
    reserved_stock: i64,
    updated_at: chrono::DateTime<chrono::Utc>,
}

impl From<ProductRow> for ProductStock {
    fn from(row: ProductRow) -> Self {
        ProductStock {
            product_id: row.id,
            name: row.name,
            price: row.price,
            stock: row.stock,
            reserved_stock: row.reserved_stock,
            updated_at: row.updated_at,
        }
    }
}

fn backend(err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &err {
        if db.is_unique_violation() {
            return StoreError::Duplicate(db.message().to_string());
        }
    }
    StoreError::Backend(err.to_string())
}

impl PgStore {
    pub async fn connect(connection_string: &str, max_connections: u32) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(3))
            .connect(connection_string)
            .await?;

        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        info!("Running database migrations...");
        sqlx::migrate!("../migrations")
            .run(&self.pool)
            .await?;
        info!("Migrations completed successfully.");
        Ok(())
    }
}

#[async_trait]
impl OrderStore for PgStore {
    async fn insert_order(&self, order: &Order) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO orders (id, customer_id, status, approval_token, rejection_token, doc, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(order.id)
        .bind(&order.customer.id)
        .bind(order.status.as_str())
        .bind(&order.approval_token)
        .bind(&order.rejection_token)
        .bind(Json(order))
        .bind(order.created_at)
        .bind(order.updated_at)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn get_order(&self, id: Uuid) -> StoreResult<Option<Order>> {
        let row: Option<(Json<Order>,)> = sqlx::query_as("SELECT doc FROM orders WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        Ok(row.map(|(Json(order),)| order))
    }

    async fn list_orders(&self, customer_id: &str) -> StoreResult<Vec<Order>> {
        let rows: Vec<(Json<Order>,)> = sqlx::query_as(
            "SELECT doc FROM orders WHERE customer_id = $1 ORDER BY created_at DESC",
        )
        .bind(customer_id)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        Ok(rows.into_iter().map(|(Json(order),)| order).collect())
    }

    async fn swap_order(&self, guard: &OrderGuard, next: &Order) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE orders
            SET status = $2, approval_token = $3, rejection_token = $4, doc = $5, updated_at = $6
            WHERE id = $1
              AND status = $7
              AND approval_token IS NOT DISTINCT FROM $8
              AND rejection_token IS NOT DISTINCT FROM $9
            "#,
        )
        .bind(guard.order_id)
        .bind(next.status.as_str())
        .bind(&next.approval_token)
        .bind(&next.rejection_token)
        .bind(Json(next))
        .bind(next.updated_at)
        .bind(guard.status.as_str())
        .bind(&guard.approval_token)
        .bind(&guard.rejection_token)
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }

        // Distinguish a lost race from a missing row
        match self.get_order(guard.order_id).await? {
            Some(_) => Ok(false),
            None => Err(StoreError::NotFound(guard.order_id.to_string())),
        }
    }

    async fn put_receipt(&self, order_id: Uuid, bytes: Vec<u8>) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO order_receipts (order_id, bytes) VALUES ($1, $2)
            ON CONFLICT (order_id) DO UPDATE SET bytes = EXCLUDED.bytes, created_at = NOW()
            "#,
        )
        .bind(order_id)
        .bind(bytes)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn get_receipt(&self, order_id: Uuid) -> StoreResult<Option<Vec<u8>>> {
        let row: Option<(Vec<u8>,)> =
            sqlx::query_as("SELECT bytes FROM order_receipts WHERE order_id = $1")
                .bind(order_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(backend)?;
        Ok(row.map(|(bytes,)| bytes))
    }
}

#[async_trait]
impl ProductStore for PgStore {
    async fn insert_product(&self, product: &ProductStock) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO products (id, name, price, stock, reserved_stock, updated_at) VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(product.product_id)
        .bind(&product.name)
        .bind(product.price)
        .bind(product.stock)
        .bind(product.reserved_stock)
        .bind(product.updated_at)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn get_product(&self, id: Uuid) -> StoreResult<Option<ProductStock>> {
        let row = sqlx::query_as::<_, ProductRow>(
            "SELECT id, name, price, stock, reserved_stock, updated_at FROM products WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        Ok(row.map(ProductStock::from))
    }

    async fn adjust_stock(&self, product_id: Uuid, delta: StockDelta) -> StoreResult<StockAdjustment> {
        // The row lock taken by UPDATE serializes concurrent adjustments of one
        // product; the WHERE clause re-checks the invariant against the locked row.
        let updated = sqlx::query_as::<_, ProductRow>(
            r#"
            UPDATE products
            SET stock = stock + $2, reserved_stock = reserved_stock + $3, updated_at = NOW()
            WHERE id = $1
              AND stock + $2 >= 0
              AND reserved_stock + $3 >= 0
              AND reserved_stock + $3 <= stock + $2
            RETURNING id, name, price, stock, reserved_stock, updated_at
            "#,
        )
        .bind(product_id)
        .bind(delta.stock)
        .bind(delta.reserved)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        if let Some(row) = updated {
            return Ok(StockAdjustment::Applied(row.into()));
        }

        match self.get_product(product_id).await? {
            Some(current) => Ok(StockAdjustment::Refused(current)),
            None => Err(StoreError::NotFound(product_id.to_string())),
        }
    }
}

#[async_trait]
impl LogStore for PgStore {
    async fn append_message_log(&self, entry: &MessageLog) -> StoreResult<()> {
        sqlx::query("INSERT INTO message_logs (id, job_id, doc, created_at) VALUES ($1, $2, $3, $4)")
            .bind(entry.id)
            .bind(entry.job_id)
            .bind(Json(entry))
            .bind(entry.created_at)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn message_logs_for_job(&self, job_id: Uuid) -> StoreResult<Vec<MessageLog>> {
        let rows: Vec<(Json<MessageLog>,)> = sqlx::query_as(
            "SELECT doc FROM message_logs WHERE job_id = $1 ORDER BY created_at",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        Ok(rows.into_iter().map(|(Json(entry),)| entry).collect())
    }

    async fn append_admin_action(&self, entry: &AdminActionLog) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO admin_action_logs (id, order_id, doc, created_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(entry.id)
        .bind(entry.order_id)
        .bind(Json(entry))
        .bind(entry.created_at)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn admin_actions_for_order(&self, order_id: Uuid) -> StoreResult<Vec<AdminActionLog>> {
        let rows: Vec<(Json<AdminActionLog>,)> = sqlx::query_as(
            "SELECT doc FROM admin_action_logs WHERE order_id = $1 ORDER BY created_at",
        )
        .bind(order_id)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        Ok(rows.into_iter().map(|(Json(entry),)| entry).collect())
    }
}
