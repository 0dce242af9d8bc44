use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use tally_shared::AdminAction;

/// Claims of an approval capability.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApprovalClaims {
    /// Order id
    pub sub: String,
    pub act: AdminAction,
    /// Admin e-mail the link was sent to
    pub adm: String,
    /// Network origin of the admin at issuance
    pub org: String,
    pub iat: i64,
    pub exp: i64,
    /// Makes two tokens for the same order and action distinct
    pub jti: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Why a presented token was refused. Only ever recorded in the audit log;
/// callers see one undifferentiated rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenRejection {
    Malformed,
    BadSignature,
    Expired,
    OrderMismatch,
    ActionMismatch,
    /// Cryptographically valid but no longer the one stored on the order.
    StaleToken,
}

impl TokenRejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenRejection::Malformed => "malformed",
            TokenRejection::BadSignature => "bad_signature",
            TokenRejection::Expired => "expired",
            TokenRejection::OrderMismatch => "order_mismatch",
            TokenRejection::ActionMismatch => "action_mismatch",
            TokenRejection::StaleToken => "stale_token",
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Failed to sign approval token: {0}")]
pub struct TokenError(#[from] jsonwebtoken::errors::Error);

/// Issues and verifies HS256-signed approval tokens.
///
/// Verification is purely cryptographic plus claim checks. Whether a token is
/// still the one stored on the order is for the state machine to decide.
pub struct ApprovalTokenService {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl: Duration,
}

impl ApprovalTokenService {
    pub fn new(secret: &[u8], ttl_hours: i64) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            ttl: Duration::hours(ttl_hours),
        }
    }

    pub fn generate(
        &self,
        order_id: Uuid,
        action: AdminAction,
        admin_email: &str,
        admin_origin: &str,
    ) -> Result<IssuedToken, TokenError> {
        self.generate_at(order_id, action, admin_email, admin_origin, Utc::now())
    }

    pub fn generate_at(
        &self,
        order_id: Uuid,
        action: AdminAction,
        admin_email: &str,
        admin_origin: &str,
        now: DateTime<Utc>,
    ) -> Result<IssuedToken, TokenError> {
        let expires_at = now + self.ttl;
        let claims = ApprovalClaims {
            sub: order_id.to_string(),
            act: action,
            adm: admin_email.to_string(),
            org: admin_origin.to_string(),
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
            jti: Uuid::new_v4().to_string(),
        };

        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)?;
        Ok(IssuedToken { token, expires_at })
    }

    /// Fails closed: `None` for anything but a well-formed, correctly signed,
    /// unexpired token issued for `expected_order_id`.
    pub fn verify(&self, token: &str, expected_order_id: Uuid) -> Option<ApprovalClaims> {
        self.verify_at(token, expected_order_id, Utc::now())
    }

    pub fn verify_at(&self, token: &str, expected_order_id: Uuid, now: DateTime<Utc>) -> Option<ApprovalClaims> {
        self.inspect_at(token, expected_order_id, now).ok()
    }

    /// Same checks as `verify_at`, reporting which one failed.
    pub fn inspect_at(
        &self,
        token: &str,
        expected_order_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<ApprovalClaims, TokenRejection> {
        // Expiry is checked below against `now`, with no leeway
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);

        let claims = decode::<ApprovalClaims>(token, &self.decoding, &validation)
            .map_err(|e| match e.kind() {
                ErrorKind::InvalidSignature => TokenRejection::BadSignature,
                _ => TokenRejection::Malformed,
            })?
            .claims;

        if now.timestamp() >= claims.exp {
            return Err(TokenRejection::Expired);
        }
        if claims.sub != expected_order_id.to_string() {
            return Err(TokenRejection::OrderMismatch);
        }

        Ok(claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> ApprovalTokenService {
        ApprovalTokenService::new(b"test-approval-secret", 24)
    }

    fn issue(svc: &ApprovalTokenService, order_id: Uuid, now: DateTime<Utc>) -> String {
        svc.generate_at(order_id, AdminAction::Approve, "admin@shop.example", "203.0.113.7", now)
            .unwrap()
            .token
    }

    #[test]
    fn test_valid_token_carries_claims() {
        let svc = service();
        let order_id = Uuid::new_v4();
        let now = Utc::now();
        let issued = svc
            .generate_at(order_id, AdminAction::Reject, "admin@shop.example", "203.0.113.7", now)
            .unwrap();

        let claims = svc.verify_at(&issued.token, order_id, now).unwrap();
        assert_eq!(claims.sub, order_id.to_string());
        assert_eq!(claims.act, AdminAction::Reject);
        assert_eq!(claims.adm, "admin@shop.example");
        assert_eq!(claims.org, "203.0.113.7");
        assert_eq!(claims.exp - claims.iat, 24 * 3600);
        assert_eq!(issued.expires_at.timestamp(), claims.exp);
    }

    #[test]
    fn test_token_for_other_order_fails() {
        let svc = service();
        let order_a = Uuid::new_v4();
        let order_b = Uuid::new_v4();
        let token = issue(&svc, order_a, Utc::now());

        assert!(svc.verify(&token, order_b).is_none());
        assert_eq!(
            svc.inspect_at(&token, order_b, Utc::now()).unwrap_err(),
            TokenRejection::OrderMismatch
        );
    }

    #[test]
    fn test_any_flipped_byte_fails() {
        let svc = service();
        let order_id = Uuid::new_v4();
        let now = Utc::now();
        let token = issue(&svc, order_id, now);
        assert!(svc.verify_at(&token, order_id, now).is_some());

        let bytes = token.as_bytes();
        for i in 0..bytes.len() {
            let mut tampered = bytes.to_vec();
            tampered[i] ^= 0x01;
            let tampered = String::from_utf8_lossy(&tampered).into_owned();
            assert!(
                svc.verify_at(&tampered, order_id, now).is_none(),
                "token with byte {} flipped was accepted",
                i
            );
        }
    }

    #[test]
    fn test_expires_after_24_hours() {
        let svc = service();
        let order_id = Uuid::new_v4();
        let issued_at = Utc::now();
        let token = issue(&svc, order_id, issued_at);

        assert!(svc.verify_at(&token, order_id, issued_at + Duration::hours(23)).is_some());
        assert!(svc.verify_at(&token, order_id, issued_at + Duration::hours(24)).is_none());
        assert_eq!(
            svc.inspect_at(&token, order_id, issued_at + Duration::hours(24) + Duration::seconds(1))
                .unwrap_err(),
            TokenRejection::Expired
        );
    }

    #[test]
    fn test_tokens_are_distinct() {
        let svc = service();
        let order_id = Uuid::new_v4();
        let now = Utc::now();
        assert_ne!(issue(&svc, order_id, now), issue(&svc, order_id, now));
    }

    #[test]
    fn test_other_secret_and_garbage_fail() {
        let order_id = Uuid::new_v4();
        let now = Utc::now();
        let foreign = ApprovalTokenService::new(b"someone-else", 24);
        let token = issue(&foreign, order_id, now);

        let svc = service();
        assert_eq!(svc.inspect_at(&token, order_id, now).unwrap_err(), TokenRejection::BadSignature);
        assert_eq!(svc.inspect_at("not-a-token", order_id, now).unwrap_err(), TokenRejection::Malformed);
        assert!(svc.verify_at("", order_id, now).is_none());
    }
}
