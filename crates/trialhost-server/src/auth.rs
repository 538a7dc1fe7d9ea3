//! Token guard for endpoints that create or destroy resources.
//!
//! When a token is configured, `POST /api/provisions` and
//! `POST /api/deprovisions` require the `X-Api-Token` header to match it.

use axum::http::{HeaderMap, StatusCode};
use subtle::ConstantTimeEq;

/// Header carrying the API token.
pub const TOKEN_HEADER: &str = "X-Api-Token";

/// Verify the API token from request headers.
///
/// `expected = None` disables the guard.
pub fn verify_token(
    headers: &HeaderMap,
    expected: Option<&str>,
) -> Result<(), (StatusCode, &'static str)> {
    let Some(expected) = expected else {
        return Ok(());
    };

    match headers.get(TOKEN_HEADER) {
        Some(token) => {
            let provided = token.to_str().unwrap_or("").as_bytes();
            if bool::from(provided.ct_eq(expected.as_bytes())) {
                Ok(())
            } else {
                Err((StatusCode::UNAUTHORIZED, "Invalid API token"))
            }
        }
        None => Err((StatusCode::UNAUTHORIZED, "Missing X-Api-Token header")),
    }
}
