use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use uuid::Uuid;

use tally_core::StoreError;
use tally_notify::QueueError;
use tally_order::OrderError;

#[derive(Debug)]
pub enum AppError {
    Unauthenticated(String),
    Forbidden(String),
    Validation(String),
    InsufficientStock {
        product_id: Uuid,
        product_name: String,
        requested: i64,
        available: i64,
        deficit: i64,
    },
    UnsupportedReceipt(String),
    /// One body for every refused approval link.
    TokenInvalid,
    NotFound(String),
    Conflict(String),
    RateLimited,
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            AppError::Unauthenticated(msg) => (StatusCode::UNAUTHORIZED, json!({ "error": msg })),
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, json!({ "error": msg })),
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, json!({ "error": msg })),
            AppError::InsufficientStock {
                product_id,
                product_name,
                requested,
                available,
                deficit,
            } => (
                StatusCode::BAD_REQUEST,
                json!({
                    "error": format!("Insufficient stock for {}", product_name),
                    "product_id": product_id,
                    "product_name": product_name,
                    "requested": requested,
                    "available": available,
                    "deficit": deficit,
                }),
            ),
            AppError::UnsupportedReceipt(msg) => (StatusCode::BAD_REQUEST, json!({ "error": msg })),
            AppError::TokenInvalid => (
                StatusCode::FORBIDDEN,
                json!({ "error": "Invalid or expired approval link" }),
            ),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, json!({ "error": msg })),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, json!({ "error": msg })),
            AppError::RateLimited => (
                StatusCode::TOO_MANY_REQUESTS,
                json!({ "error": "Too many attempts, try again later" }),
            ),
            AppError::Internal(msg) => {
                tracing::error!("Internal Server Error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "error": "Internal Server Error" }),
                )
            }
        };

        (status, Json(body)).into_response()
    }
}

impl From<OrderError> for AppError {
    fn from(err: OrderError) -> Self {
        match err {
            OrderError::Validation(msg) => AppError::Validation(msg),
            OrderError::InsufficientStock {
                product_id,
                product_name,
                requested,
                available,
                deficit,
            } => AppError::InsufficientStock {
                product_id,
                product_name,
                requested,
                available,
                deficit,
            },
            OrderError::Receipt(e) => AppError::UnsupportedReceipt(e.to_string()),
            OrderError::TokenInvalid => AppError::TokenInvalid,
            OrderError::NotFound(id) => AppError::NotFound(format!("Order {} not found", id)),
            OrderError::Conflict(msg) => AppError::Conflict(msg),
            OrderError::Persistence(msg) | OrderError::Internal(msg) => AppError::Internal(msg),
        }
    }
}

impl From<QueueError> for AppError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::UnknownJob(id) => AppError::NotFound(format!("Job {} not found", id)),
            QueueError::NotDeadLettered(id) => AppError::Conflict(format!("Job {} is not dead-lettered", id)),
            other => AppError::Internal(other.to_string()),
        }
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Duplicate(msg) => AppError::Conflict(msg),
            StoreError::NotFound(msg) => AppError::NotFound(msg),
            other => AppError::Internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_errors_map_to_statuses() {
        let cases = [
            (OrderError::Validation("x".into()), StatusCode::BAD_REQUEST),
            (OrderError::TokenInvalid, StatusCode::FORBIDDEN),
            (OrderError::NotFound(Uuid::new_v4()), StatusCode::NOT_FOUND),
            (OrderError::Conflict("x".into()), StatusCode::CONFLICT),
            (OrderError::Persistence("db down".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(AppError::from(err).into_response().status(), status);
        }
    }
}
