//! Bearer token extraction and authorization helpers.
//!
//! Flow Overview: read the `Authorization: Bearer` header, verify it through
//! the orchestrator (signature, issuer, audience, expiry) and hand the claims
//! to the handler. Admin routes additionally require the configured admin role.

use axum::http::{HeaderMap, header::AUTHORIZATION};

use crate::{
    api::ApiError,
    identity::{Orchestrator, SessionClaims},
};

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| {
            value
                .strip_prefix("Bearer ")
                .or_else(|| value.strip_prefix("bearer "))
        })
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Verified claims, or 401 when the header is missing or the token is bad.
pub fn require_auth(
    headers: &HeaderMap,
    orchestrator: &Orchestrator,
) -> Result<SessionClaims, ApiError> {
    let token = bearer_token(headers).ok_or(ApiError::Unauthorized)?;
    orchestrator
        .verify_token(token)
        .map_err(|_| ApiError::Unauthorized)
}

/// `None` without a header; a header that fails verification is still 401.
pub fn optional_auth(
    headers: &HeaderMap,
    orchestrator: &Orchestrator,
) -> Result<Option<SessionClaims>, ApiError> {
    if headers.get(AUTHORIZATION).is_none() {
        return Ok(None);
    }
    require_auth(headers, orchestrator).map(Some)
}

pub fn require_admin(
    headers: &HeaderMap,
    orchestrator: &Orchestrator,
) -> Result<SessionClaims, ApiError> {
    let claims = require_auth(headers, orchestrator)?;
    if orchestrator.is_admin(&claims) {
        Ok(claims)
    } else {
        Err(ApiError::Forbidden)
    }
}
