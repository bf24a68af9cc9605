//! Bearer token check for admin routes.

use axum::{
    body::Body,
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::Response,
};
use subtle::ConstantTimeEq;

use super::error::ApiError;
use crate::AppState;

/// Reject the request unless it carries `Authorization: Bearer <admin token>`.
pub async fn require_admin(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let presented = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(bearer_token)
        .ok_or(ApiError::MissingToken)?;

    let expected = state
        .config
        .auth
        .admin_token
        .as_deref()
        .map(str::trim)
        .unwrap_or_default();
    if !token_matches(presented, expected) {
        tracing::warn!(path = %req.uri().path(), "Rejected admin request with invalid token");
        return Err(ApiError::InvalidToken);
    }

    Ok(next.run(req).await)
}

/// Constant-time comparison; an empty expected token matches nothing.
fn token_matches(presented: &str, expected: &str) -> bool {
    !expected.is_empty() && bool::from(presented.as_bytes().ct_eq(expected.as_bytes()))
}

fn bearer_token(header: &str) -> Option<&str> {
    let (scheme, token) = header.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}
