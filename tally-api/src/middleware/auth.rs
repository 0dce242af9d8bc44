use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::state::{AppState, AuthConfig};

pub const ROLE_CUSTOMER: &str = "CUSTOMER";
pub const ROLE_ADMIN: &str = "ADMIN";

// ============================================================================
// Session Claims
// ============================================================================

/// Session of a signed-in shopper or admin. Distinct from the single-purpose
/// approval tokens mailed to the admin.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SessionClaims {
    /// Customer id for shoppers
    pub sub: String,
    pub email: String,
    pub role: String,
    pub exp: usize,
}

impl SessionClaims {
    pub fn is_admin(&self) -> bool {
        self.role == ROLE_ADMIN
    }

    /// Owners and admins may see an order; nobody else.
    pub fn may_access(&self, customer_id: &str) -> bool {
        self.is_admin() || self.sub == customer_id
    }
}

pub fn issue_session(
    auth: &AuthConfig,
    sub: &str,
    email: &str,
    role: &str,
) -> Result<String, jsonwebtoken::errors::Error> {
    let claims = SessionClaims {
        sub: sub.to_string(),
        email: email.to_string(),
        role: role.to_string(),
        exp: (Utc::now() + Duration::seconds(auth.expiration as i64)).timestamp() as usize,
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(auth.secret.as_bytes()))
}

fn session_from(req: &Request, auth: &AuthConfig) -> Result<SessionClaims, AppError> {
    let auth_header = req
        .headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .ok_or_else(|| AppError::Unauthenticated("Missing session".to_string()))?;

    let token = auth_header
        .strip_prefix("Bearer ")
        .ok_or_else(|| AppError::Unauthenticated("Malformed Authorization header".to_string()))?;

    let token_data = decode::<SessionClaims>(
        token,
        &DecodingKey::from_secret(auth.secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|_| AppError::Unauthenticated("Invalid or expired session".to_string()))?;

    Ok(token_data.claims)
}

// ============================================================================
// Session Middleware
// ============================================================================

/// Any signed-in caller. Ownership is checked by the handlers.
pub async fn session_auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let claims = session_from(&req, &state.auth)?;
    if claims.role != ROLE_CUSTOMER && claims.role != ROLE_ADMIN {
        return Err(AppError::Forbidden(format!("Unknown role {}", claims.role)));
    }

    req.extensions_mut().insert(claims);
    Ok(next.run(req).await)
}

pub async fn admin_auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let claims = session_from(&req, &state.auth)?;
    if !claims.is_admin() {
        return Err(AppError::Forbidden("Admin role required".to_string()));
    }

    req.extensions_mut().insert(claims);
    Ok(next.run(req).await)
}
