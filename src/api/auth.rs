// =============================================================================
// Authentication — bearer tokens with constant-time comparison
// =============================================================================
//
// Two credentials exist at this surface:
//   - The admin token from the `MERIDIAN_ADMIN_TOKEN` environment variable,
//     required for admin endpoints.
//   - User session tokens minted at login: `account_id.expiry_ms.signature`
//     where the signature is HMAC-SHA256 over the first two parts, keyed by
//     `MERIDIAN_TOKEN_SECRET` (falling back to the admin token).
//
// Account credentials themselves are opaque SHA-256 hex blobs; the core
// never stores or compares a plaintext password.
//
// All comparisons are constant time.
// =============================================================================

use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use tracing::warn;

type HmacSha256 = Hmac<Sha256>;

// =============================================================================
// Constant-time comparison
// =============================================================================

/// Compare two byte slices in constant time. The comparison always examines
/// every byte even when a mismatch is found early.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

/// Hex SHA-256 of a presented password, the only form the core compares.
pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

// =============================================================================
// User session tokens
// =============================================================================

fn token_secret() -> String {
    std::env::var("MERIDIAN_TOKEN_SECRET")
        .or_else(|_| std::env::var("MERIDIAN_ADMIN_TOKEN"))
        .unwrap_or_default()
}

fn sign(payload: &str, secret: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
    mac.update(payload.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Mint a session token for `account_id` valid until `expiry_ms`.
pub fn mint_user_token(account_id: u64, expiry_ms: i64) -> String {
    let payload = format!("{account_id}.{expiry_ms}");
    let sig = sign(&payload, &token_secret());
    format!("{payload}.{sig}")
}

/// Validate a session token and return the account id it names.
pub fn verify_user_token(token: &str, now_ms: i64) -> Option<u64> {
    let mut parts = token.splitn(3, '.');
    let account_id: u64 = parts.next()?.parse().ok()?;
    let expiry_ms: i64 = parts.next()?.parse().ok()?;
    let presented_sig = parts.next()?;

    let payload = format!("{account_id}.{expiry_ms}");
    let expected_sig = sign(&payload, &token_secret());
    if !constant_time_eq(presented_sig.as_bytes(), expected_sig.as_bytes()) {
        return None;
    }
    if now_ms >= expiry_ms {
        return None;
    }
    Some(account_id)
}

/// Validate the admin token (also used for WebSocket query-param auth).
pub fn validate_admin_token(token: &str) -> bool {
    let expected = std::env::var("MERIDIAN_ADMIN_TOKEN").unwrap_or_default();
    if expected.is_empty() {
        return false;
    }
    constant_time_eq(token.as_bytes(), expected.as_bytes())
}

/// Either credential works at the WebSocket door.
pub fn validate_ws_token(token: &str, now_ms: i64) -> bool {
    validate_admin_token(token) || verify_user_token(token, now_ms).is_some()
}

// =============================================================================
// Extractors
// =============================================================================

pub struct AuthRejection {
    status: StatusCode,
    message: &'static str,
}

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.message,
            "code": "forbidden",
        });
        (self.status, axum::Json(body)).into_response()
    }
}

fn bearer_token(parts: &Parts) -> Option<&str> {
    parts
        .headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

/// Admin-token extractor for admin endpoints.
pub struct AuthAdmin(pub String);

impl<S> FromRequestParts<S> for AuthAdmin
where
    S: Send + Sync,
{
    type Rejection = AuthRejection;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        // Read on every request so rotation does not require a restart.
        let expected = std::env::var("MERIDIAN_ADMIN_TOKEN").unwrap_or_default();
        if expected.is_empty() {
            warn!("MERIDIAN_ADMIN_TOKEN is not set, all admin requests are rejected");
            return Err(AuthRejection {
                status: StatusCode::FORBIDDEN,
                message: "Server authentication not configured",
            });
        }

        let Some(token) = bearer_token(parts) else {
            return Err(AuthRejection {
                status: StatusCode::FORBIDDEN,
                message: "Missing or invalid authorization token",
            });
        };
        if !constant_time_eq(token.as_bytes(), expected.as_bytes()) {
            warn!("invalid admin token presented");
            return Err(AuthRejection {
                status: StatusCode::FORBIDDEN,
                message: "Invalid authorization token",
            });
        }
        Ok(AuthAdmin(token.to_string()))
    }
}

/// User-session extractor: yields the authenticated account id. The admin
/// token also passes, yielding no bound account.
pub struct AuthUser(pub Option<u64>);

impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = AuthRejection;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let Some(token) = bearer_token(parts) else {
            return Err(AuthRejection {
                status: StatusCode::UNAUTHORIZED,
                message: "Missing or invalid authorization token",
            });
        };
        if validate_admin_token(token) {
            return Ok(AuthUser(None));
        }
        let now_ms = chrono::Utc::now().timestamp_millis();
        match verify_user_token(token, now_ms) {
            Some(account_id) => Ok(AuthUser(Some(account_id))),
            None => Err(AuthRejection {
                status: StatusCode::UNAUTHORIZED,
                message: "Invalid or expired token",
            }),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_identical() {
        assert!(constant_time_eq(b"hello", b"hello"));
    }

    #[test]
    fn constant_time_eq_different() {
        assert!(!constant_time_eq(b"hello", b"world"));
        assert!(!constant_time_eq(b"short", b"longer_string"));
        assert!(constant_time_eq(b"", b""));
        assert!(!constant_time_eq(b"\x00", b"\x01"));
    }

    #[test]
    fn sha256_hex_shape() {
        let h = sha256_hex("hunter2");
        assert_eq!(h.len(), 64);
        assert!(h.bytes().all(|b| b.is_ascii_hexdigit()));
        assert_eq!(h, sha256_hex("hunter2"));
        assert_ne!(h, sha256_hex("hunter3"));
    }

    #[test]
    fn user_token_roundtrip() {
        std::env::set_var("MERIDIAN_TOKEN_SECRET", "test-secret");
        let token = mint_user_token(42, 1_000_000);
        assert_eq!(verify_user_token(&token, 500_000), Some(42));
        // Expired.
        assert_eq!(verify_user_token(&token, 1_000_000), None);
        // Tampered account id.
        let forged = token.replacen("42.", "43.", 1);
        assert_eq!(verify_user_token(&forged, 500_000), None);
        // Garbage.
        assert_eq!(verify_user_token("abc", 0), None);
    }
}
