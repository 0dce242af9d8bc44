use axum::{
    extract::{Path, State},
    http::StatusCode,
    middleware,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use tally_core::{LogStore, ProductStore};
use tally_order::OrderError;
use tally_shared::{AdminActionLog, Channel, MessageLog, NotificationJob, OrderStatus, ProductStock, StockLine};

use crate::error::AppError;
use crate::middleware::admin_auth_middleware;
use crate::orders::ResolutionResponse;
use crate::state::AppState;

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct CreateProductRequest {
    pub name: String,
    pub price: i64,
    pub stock: i64,
}

#[derive(Debug, Deserialize)]
pub struct RestockRequest {
    pub quantity: i64,
}

#[derive(Debug, Serialize)]
pub struct ProductResponse {
    pub product_id: Uuid,
    pub name: String,
    pub price: i64,
    pub stock: i64,
    pub reserved_stock: i64,
    pub available: i64,
}

impl From<ProductStock> for ProductResponse {
    fn from(p: ProductStock) -> Self {
        Self {
            available: p.available(),
            product_id: p.product_id,
            name: p.name,
            price: p.price,
            stock: p.stock,
            reserved_stock: p.reserved_stock,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct FulfillmentRequest {
    pub status: OrderStatus,
}

#[derive(Debug, Serialize)]
pub struct ReminderResponse {
    pub jobs_enqueued: usize,
}

#[derive(Debug, Serialize)]
pub struct JobResponse {
    pub job: NotificationJob,
    pub attempts: Vec<MessageLog>,
}

pub fn routes(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/admin/products", post(create_product))
        .route("/admin/products/{id}", get(get_product))
        .route("/admin/products/{id}/restock", post(restock_product))
        .route("/orders/{id}/fulfillment", post(advance_fulfillment))
        .route("/orders/{id}/reminder", post(send_reminder))
        .route("/admin/orders/{id}/audit", get(audit_trail))
        .route("/admin/dead-letters/{channel}", get(list_dead_letters))
        .route("/admin/jobs/{id}", get(get_job))
        .route("/admin/jobs/{id}/replay", post(replay_job))
        .route_layer(middleware::from_fn_with_state(state, admin_auth_middleware))
}

// ============================================================================
// Catalog
// ============================================================================

/// POST /admin/products
async fn create_product(
    State(state): State<AppState>,
    Json(req): Json<CreateProductRequest>,
) -> Result<(StatusCode, Json<ProductResponse>), AppError> {
    if req.name.trim().is_empty() {
        return Err(AppError::Validation("Product name is required".to_string()));
    }
    if req.price < 0 {
        return Err(AppError::Validation("Price cannot be negative".to_string()));
    }
    if req.stock < 0 {
        return Err(AppError::Validation("Stock cannot be negative".to_string()));
    }

    let product = ProductStock::new(Uuid::new_v4(), req.name, req.price, req.stock);
    state.store.insert_product(&product).await?;
    info!("Product {} ({}) created with {} units", product.name, product.product_id, product.stock);
    Ok((StatusCode::CREATED, Json(product.into())))
}

/// GET /admin/products/:id
async fn get_product(
    State(state): State<AppState>,
    Path(product_id): Path<Uuid>,
) -> Result<Json<ProductResponse>, AppError> {
    let product = state
        .orders
        .ledger()
        .get(product_id)
        .await
        .map_err(OrderError::from)?
        .ok_or_else(|| AppError::NotFound(format!("Product {} not found", product_id)))?;
    Ok(Json(product.into()))
}

/// POST /admin/products/:id/restock
async fn restock_product(
    State(state): State<AppState>,
    Path(product_id): Path<Uuid>,
    Json(req): Json<RestockRequest>,
) -> Result<Json<ProductResponse>, AppError> {
    let ledger = state.orders.ledger();
    ledger
        .restock(&[StockLine {
            product_id,
            quantity: req.quantity,
        }])
        .await
        .map_err(OrderError::from)?;

    let product = ledger
        .get(product_id)
        .await
        .map_err(OrderError::from)?
        .ok_or_else(|| AppError::NotFound(format!("Product {} not found", product_id)))?;
    Ok(Json(product.into()))
}

// ============================================================================
// Orders
// ============================================================================

/// POST /orders/:id/fulfillment
async fn advance_fulfillment(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
    Json(req): Json<FulfillmentRequest>,
) -> Result<Json<ResolutionResponse>, AppError> {
    let resolution = state.orders.advance_fulfillment(order_id, req.status).await?;
    Ok(Json(ResolutionResponse::new(resolution)))
}

/// POST /orders/:id/reminder
async fn send_reminder(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
) -> Result<Json<ReminderResponse>, AppError> {
    let jobs_enqueued = state.orders.send_payment_reminder(order_id).await?;
    Ok(Json(ReminderResponse { jobs_enqueued }))
}

/// GET /admin/orders/:id/audit
async fn audit_trail(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
) -> Result<Json<Vec<AdminActionLog>>, AppError> {
    Ok(Json(state.orders.audit_trail(order_id).await?))
}

// ============================================================================
// Notification Jobs
// ============================================================================

/// GET /admin/dead-letters/:channel
async fn list_dead_letters(
    State(state): State<AppState>,
    Path(channel): Path<Channel>,
) -> Result<Json<Vec<NotificationJob>>, AppError> {
    Ok(Json(state.dispatcher.dead_letters(channel).await?))
}

/// GET /admin/jobs/:id
/// Current job state plus every recorded delivery attempt
async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobResponse>, AppError> {
    let job = state
        .dispatcher
        .job(job_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Job {} not found", job_id)))?;
    let attempts = state.store.message_logs_for_job(job_id).await?;
    Ok(Json(JobResponse { job, attempts }))
}

/// POST /admin/jobs/:id/replay
async fn replay_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<NotificationJob>, AppError> {
    Ok(Json(state.dispatcher.replay(job_id).await?))
}
