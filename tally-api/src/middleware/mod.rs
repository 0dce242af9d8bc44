pub mod auth;
pub mod origin;

pub use auth::{admin_auth_middleware, session_auth_middleware, SessionClaims};
pub use origin::ClientOrigin;
