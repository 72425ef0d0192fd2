//! API handlers and the helpers they share: JSON error bodies, bearer token
//! authentication and identifier validation.

pub mod admin;
pub mod auth;
pub mod health;
pub mod types;

use axum::{
    http::{header::AUTHORIZATION, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
};
use regex::Regex;
use tracing::error;

use self::types::{ErrorResponse, LockedResponse};
use crate::api::state::AppState;
use crate::lockout::LockoutInfo;
use crate::tokens::{AccessClaims, AccessTokenError};

/// Lightweight email sanity check on an already-normalized identifier.
#[must_use]
pub fn valid_identifier(identifier: &str) -> bool {
    Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").is_ok_and(|re| re.is_match(identifier))
}

pub(crate) fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.to_string(),
        }),
    )
        .into_response()
}

pub(crate) fn unauthorized() -> Response {
    error_response(StatusCode::UNAUTHORIZED, "unauthorized")
}

pub(crate) fn unavailable() -> Response {
    error_response(StatusCode::SERVICE_UNAVAILABLE, "service unavailable")
}

/// 423 with `minutes_remaining` and `Retry-After`.
pub(crate) fn locked_response(info: &LockoutInfo) -> Response {
    let mut response = (
        StatusCode::LOCKED,
        Json(LockedResponse {
            error: "too many failed login attempts".to_string(),
            minutes_remaining: info.minutes_remaining,
        }),
    )
        .into_response();
    if let Ok(value) = HeaderValue::from_str(&info.retry_after_seconds.to_string()) {
        response.headers_mut().insert("retry-after", value);
    }
    response
}

pub(crate) fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let trimmed = value.trim();
    let token = trimmed
        .strip_prefix("Bearer ")
        .or_else(|| trimmed.strip_prefix("bearer "))?
        .trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

/// Verify the bearer access token, including the blacklist.
///
/// Rejections are rendered as generic 401s; a blacklist outage is a 503.
pub(crate) async fn authenticate(
    headers: &HeaderMap,
    state: &AppState,
) -> Result<AccessClaims, Response> {
    let Some(token) = extract_bearer_token(headers) else {
        return Err(unauthorized());
    };
    match state.access.authenticate(&token, &state.tokens).await {
        Ok(claims) => Ok(claims),
        Err(AccessTokenError::Unavailable) => Err(unavailable()),
        Err(AccessTokenError::Signing(err)) => {
            error!("Unexpected signing error while verifying token: {err}");
            Err(error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal error",
            ))
        }
        Err(_) => Err(unauthorized()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_identifier_accepts_basic_format() {
        assert!(valid_identifier("a@x.com"));
        assert!(!valid_identifier("a@x"));
        assert!(!valid_identifier("not an email"));
    }

    #[test]
    fn bearer_tokens_are_extracted() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer abc.def"));
        assert_eq!(extract_bearer_token(&headers), Some("abc.def".to_string()));

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic xyz"));
        assert_eq!(extract_bearer_token(&headers), None);

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer "));
        assert_eq!(extract_bearer_token(&headers), None);
    }
}
