use crate::server::AdminState;
use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;
use std::sync::Arc;
use tracing::warn;

/// Headers an admin token may arrive in.
const TOKEN_HEADERS: &[&str] = &["x-admin-auth-token", "x-api-key"];

/// Admin API key authentication middleware.
///
/// A no-op unless `admin.api_key` is configured.
pub async fn api_key_auth(
    State(state): State<Arc<AdminState>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let Some(expected) = state.config.admin.api_key.as_deref() else {
        return next.run(request).await;
    };
    if presented_token(request.headers()).is_some_and(|t| constant_time_eq(t, expected)) {
        return next.run(request).await;
    }
    warn!(path = %request.uri().path(), "rejected admin request without a valid token");
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"error": {"code": "unauthorized", "message": "Admin token required", "retryable": false}})),
    )
        .into_response()
}

fn presented_token(headers: &HeaderMap) -> Option<&str> {
    TOKEN_HEADERS
        .iter()
        .find_map(|name| headers.get(*name).and_then(|v| v.to_str().ok()))
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    a.len() == b.len()
        && a
            .bytes()
            .zip(b.bytes())
            .fold(0u8, |acc, (x, y)| acc | (x ^ y))
            == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn token_read_from_either_header() {
        let mut headers = HeaderMap::new();
        assert!(presented_token(&headers).is_none());
        headers.insert("x-api-key", HeaderValue::from_static("k1"));
        assert_eq!(presented_token(&headers), Some("k1"));
        headers.insert("x-admin-auth-token", HeaderValue::from_static("k2"));
        assert_eq!(presented_token(&headers), Some("k2"));
    }

    #[test]
    fn token_comparison() {
        assert!(constant_time_eq("secret", "secret"));
        assert!(!constant_time_eq("secret", "secreT"));
        assert!(!constant_time_eq("secret", "secret2"));
    }
}
