//! Admin token check for `/admin` and `/internal` routes.

use axum::{
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use subtle::ConstantTimeEq;

use crate::{ApiError, AppState};

/// Header alternative to `Authorization: Bearer`.
pub const ADMIN_TOKEN_HEADER: &str = "x-admin-token";

/// Extracts the admin token from `Authorization: Bearer <token>` or
/// `X-Admin-Token`.
fn extract_admin_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .or_else(|| headers.get(ADMIN_TOKEN_HEADER).and_then(|v| v.to_str().ok()))
}

/// Rejects requests without the configured admin token. Routes stay closed
/// while no token is configured.
pub async fn require_admin_token(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(expected) = state.admin_token.as_deref().filter(|t| !t.is_empty()) else {
        return Err(ApiError::Unauthorized);
    };

    let presented = extract_admin_token(req.headers()).ok_or(ApiError::Unauthorized)?;
    if !bool::from(presented.as_bytes().ct_eq(expected.as_bytes())) {
        tracing::warn!(category = "auth", path = %req.uri().path(), "admin token rejected");
        return Err(ApiError::Unauthorized);
    }

    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn bearer_wins_over_header() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer first"));
        headers.insert(ADMIN_TOKEN_HEADER, HeaderValue::from_static("second"));
        assert_eq!(extract_admin_token(&headers), Some("first"));

        headers.remove("authorization");
        assert_eq!(extract_admin_token(&headers), Some("second"));
    }
}
