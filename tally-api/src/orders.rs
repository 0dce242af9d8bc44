use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::{header, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use tally_catalog::StockShortfall;
use tally_order::{NewOrder, OrderError, Resolution};
use tally_shared::pii::Masked;
use tally_shared::{
    Customer, Order, OrderItem, OrderStatus, PaymentMethod, PaymentReceipt, ShippingAddress,
    StockLine,
};

use crate::error::AppError;
use crate::middleware::{session_auth_middleware, ClientOrigin, SessionClaims};
use crate::state::AppState;

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct CreateOrderRequest {
    pub customer_name: String,
    pub phone: Option<String>,
    /// Name and price are taken from the catalog, never from the request.
    pub items: Vec<StockLine>,
    pub shipping_address: ShippingAddress,
    pub payment_method: PaymentMethod,
}

#[derive(Debug, Deserialize)]
pub struct StockCheckRequest {
    pub items: Vec<StockLine>,
}

#[derive(Debug, Serialize)]
pub struct StockCheckResponse {
    pub available: bool,
    pub shortfalls: Vec<ShortfallResponse>,
}

#[derive(Debug, Serialize)]
pub struct ShortfallResponse {
    pub product_id: Uuid,
    pub product_name: String,
    pub requested: i64,
    pub available: i64,
    pub deficit: i64,
}

impl From<StockShortfall> for ShortfallResponse {
    fn from(s: StockShortfall) -> Self {
        Self {
            deficit: s.deficit(),
            product_id: s.product_id,
            product_name: s.product_name,
            requested: s.requested,
            available: s.available,
        }
    }
}

/// Public view of an order. Approval tokens never leave the server except
/// inside the admin's links.
#[derive(Debug, Serialize)]
pub struct OrderResponse {
    pub id: Uuid,
    pub order_number: String,
    pub customer_id: String,
    pub customer_name: String,
    pub customer_email: Masked<String>,
    pub items: Vec<OrderItem>,
    pub shipping_address: ShippingAddress,
    pub payment_method: PaymentMethod,
    pub currency: String,
    pub total_amount: i64,
    pub status: OrderStatus,
    pub is_approved: bool,
    pub awaiting_admin: bool,
    pub approval_expires_at: Option<DateTime<Utc>>,
    pub receipt: Option<PaymentReceipt>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Order> for OrderResponse {
    fn from(order: Order) -> Self {
        Self {
            awaiting_admin: order.has_pending_tokens(),
            id: order.id,
            order_number: order.order_number,
            customer_id: order.customer.id,
            customer_name: order.customer.name,
            customer_email: Masked(order.customer.email),
            items: order.items,
            shipping_address: order.shipping_address,
            payment_method: order.payment_method,
            currency: order.currency,
            total_amount: order.total_amount,
            status: order.status,
            is_approved: order.is_approved,
            approval_expires_at: order.approval_token_expires,
            receipt: order.receipt,
            created_at: order.created_at,
            updated_at: order.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ResolutionResponse {
    pub message: String,
    pub already_processed: bool,
    pub order: OrderResponse,
}

impl ResolutionResponse {
    pub fn new(resolution: Resolution) -> Self {
        let message = if resolution.already_processed {
            format!("Order {} was already {}", resolution.order.order_number, resolution.order.status)
        } else {
            format!("Order {} is now {}", resolution.order.order_number, resolution.order.status)
        };
        Self {
            message,
            already_processed: resolution.already_processed,
            order: resolution.order.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ActionQuery {
    pub token: Option<String>,
}

// ============================================================================
// Routes
// ============================================================================

pub fn routes(state: AppState) -> Router<AppState> {
    // Approval links are capabilities in themselves; no session required
    let links = Router::new()
        .route("/orders/{id}/approve", get(approve_order))
        .route("/orders/{id}/reject", get(reject_order));

    let session = Router::new()
        .route("/orders", post(create_order).get(list_orders))
        .route("/orders/{id}", get(get_order))
        .route(
            "/orders/{id}/receipt",
            post(upload_receipt)
                .layer(DefaultBodyLimit::max(state.upload_body_limit))
                .get(download_receipt),
        )
        .route("/orders/{id}/cancel", post(cancel_order))
        .route("/stock/check", post(check_stock))
        .route_layer(middleware::from_fn_with_state(state, session_auth_middleware));

    links.merge(session)
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /orders
async fn create_order(
    State(state): State<AppState>,
    Extension(claims): Extension<SessionClaims>,
    Json(req): Json<CreateOrderRequest>,
) -> Result<(StatusCode, Json<OrderResponse>), AppError> {
    let new = NewOrder {
        customer: Customer {
            id: claims.sub.clone(),
            name: req.customer_name,
            email: claims.email.clone(),
            phone: req.phone,
        },
        items: req.items,
        shipping_address: req.shipping_address,
        payment_method: req.payment_method,
    };

    let order = state.orders.create_order(new).await?;
    Ok((StatusCode::CREATED, Json(order.into())))
}

/// GET /orders
/// The caller's own orders
async fn list_orders(
    State(state): State<AppState>,
    Extension(claims): Extension<SessionClaims>,
) -> Result<Json<Vec<OrderResponse>>, AppError> {
    let orders = state.orders.orders_for_customer(&claims.sub).await?;
    Ok(Json(orders.into_iter().map(OrderResponse::from).collect()))
}

/// Load an order the caller is allowed to see. Strangers get 401, the same
/// as a missing session.
async fn owned_order(state: &AppState, claims: &SessionClaims, order_id: Uuid) -> Result<Order, AppError> {
    let order = state.orders.get_order(order_id).await?;
    if !claims.may_access(&order.customer.id) {
        return Err(AppError::Unauthenticated("Not allowed to access this order".to_string()));
    }
    Ok(order)
}

/// GET /orders/:id
async fn get_order(
    State(state): State<AppState>,
    Extension(claims): Extension<SessionClaims>,
    Path(order_id): Path<Uuid>,
) -> Result<Json<OrderResponse>, AppError> {
    let order = owned_order(&state, &claims, order_id).await?;
    Ok(Json(order.into()))
}

/// GET /orders/:id/approve?token=...
async fn approve_order(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
    Query(query): Query<ActionQuery>,
    ClientOrigin(origin): ClientOrigin,
) -> Result<Json<ResolutionResponse>, AppError> {
    let token = query.token.unwrap_or_default();
    let resolution = state.orders.approve_order(order_id, &token, &origin).await?;
    Ok(Json(ResolutionResponse::new(resolution)))
}

/// GET /orders/:id/reject?token=...
async fn reject_order(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
    Query(query): Query<ActionQuery>,
    ClientOrigin(origin): ClientOrigin,
) -> Result<Json<ResolutionResponse>, AppError> {
    let token = query.token.unwrap_or_default();
    let resolution = state.orders.reject_order(order_id, &token, &origin).await?;
    Ok(Json(ResolutionResponse::new(resolution)))
}

/// POST /orders/:id/receipt
/// Multipart upload, file in the `receipt` field
async fn upload_receipt(
    State(state): State<AppState>,
    Extension(claims): Extension<SessionClaims>,
    Path(order_id): Path<Uuid>,
    mut multipart: Multipart,
) -> Result<Json<OrderResponse>, AppError> {
    owned_order(&state, &claims, order_id).await?;

    match state.upload_limiter.check(&format!("receipt:{}", claims.sub)).await {
        Ok(true) => {}
        Ok(false) => return Err(AppError::RateLimited),
        // Fail open
        Err(e) => warn!("Upload rate limiter unavailable: {}", e),
    }

    let mut upload = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::Validation(format!("Malformed upload: {}", e)))?
    {
        if field.name() != Some("receipt") {
            continue;
        }
        let file_name = field.file_name().unwrap_or_default().to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|e| AppError::Validation(format!("Malformed upload: {}", e)))?;
        upload = Some((file_name, bytes.to_vec()));
        break;
    }

    // No field at all is reported like an empty file
    let (file_name, bytes) = upload.unwrap_or_default();
    let order = state.orders.submit_receipt(order_id, &file_name, bytes).await?;
    Ok(Json(order.into()))
}

/// GET /orders/:id/receipt
async fn download_receipt(
    State(state): State<AppState>,
    Extension(claims): Extension<SessionClaims>,
    Path(order_id): Path<Uuid>,
) -> Result<Response, AppError> {
    owned_order(&state, &claims, order_id).await?;
    let (meta, bytes) = state.orders.receipt(order_id).await?;

    let disposition = format!("inline; filename=\"{}\"", meta.file_name.replace('"', ""));
    Ok((
        [
            (header::CONTENT_TYPE, meta.content_type),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        bytes,
    )
        .into_response())
}

/// POST /orders/:id/cancel
/// Owners may cancel while the payment is still unconfirmed; admins at any
/// non-terminal point.
async fn cancel_order(
    State(state): State<AppState>,
    Extension(claims): Extension<SessionClaims>,
    Path(order_id): Path<Uuid>,
) -> Result<Json<ResolutionResponse>, AppError> {
    let order = owned_order(&state, &claims, order_id).await?;
    if !claims.is_admin() && !order.status.awaits_admin() && order.status != OrderStatus::Cancelled {
        return Err(OrderError::Conflict(format!("order is {}, contact support to cancel", order.status)).into());
    }

    let resolution = state.orders.cancel_order(order_id).await?;
    Ok(Json(ResolutionResponse::new(resolution)))
}

/// POST /stock/check
/// Read-only availability check before checkout
async fn check_stock(
    State(state): State<AppState>,
    Json(req): Json<StockCheckRequest>,
) -> Result<Json<StockCheckResponse>, AppError> {
    let shortfalls = state
        .orders
        .ledger()
        .check_stock(&req.items)
        .await
        .map_err(OrderError::from)?;

    Ok(Json(StockCheckResponse {
        available: shortfalls.is_empty(),
        shortfalls: shortfalls.into_iter().map(ShortfallResponse::from).collect(),
    }))
}
