// =============================================================================
// Bearer Token Authentication
// =============================================================================
//
// The expected token comes from the `QUORUM_ADMIN_TOKEN` environment
// variable. Comparison is constant time. The same validator serves the REST
// extractor and the WebSocket first-frame auth.
// =============================================================================

use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::warn;

/// Compare two byte slices in constant time over equal lengths.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut acc: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        acc |= x ^ y;
    }
    acc == 0
}

/// Validate a presented token against `QUORUM_ADMIN_TOKEN`. An unset or
/// empty expected token rejects everything.
pub fn validate_token(token: &str) -> bool {
    let expected = std::env::var("QUORUM_ADMIN_TOKEN").unwrap_or_default();
    if expected.is_empty() {
        return false;
    }
    constant_time_eq(token.as_bytes(), expected.as_bytes())
}

/// Axum extractor that enforces `Authorization: Bearer <token>` on REST
/// routes. Rejection short-circuits with 403 before the handler runs.
pub struct AuthBearer(pub String);

pub struct AuthRejection;

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": "invalid or missing authorization token" });
        (StatusCode::FORBIDDEN, axum::Json(body)).into_response()
    }
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for AuthBearer
where
    S: Send + Sync,
{
    type Rejection = AuthRejection;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());

        let token = match header.and_then(|v| v.strip_prefix("Bearer ")) {
            Some(token) => token,
            None => {
                warn!("missing or malformed Authorization header");
                return Err(AuthRejection);
            }
        };

        if !validate_token(token) {
            warn!("invalid admin token presented");
            return Err(AuthRejection);
        }

        Ok(AuthBearer(token.to_string()))
    }
}

// =============================================================================
// Tests
// =============================================================================
