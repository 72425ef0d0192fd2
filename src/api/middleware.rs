//! Gateway middleware: resolves the client IP and applies the rate-limit
//! policy before any handler runs.

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{HeaderValue, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Json, Response},
};
use std::net::SocketAddr;
use tracing::{debug, warn};

use super::handlers::{error_response, types::RateLimitedResponse};
use super::state::AppState;
use crate::ratelimit::{probe::is_scanner_probe, resolve_client_ip, Decision};

pub const HEADER_LIMIT: &str = "x-ratelimit-limit";
pub const HEADER_REMAINING: &str = "x-ratelimit-remaining";
pub const HEADER_RESET: &str = "x-ratelimit-reset";
pub const HEADER_RETRY_AFTER: &str = "retry-after";

/// Client IP as resolved by the gateway, available to handlers as an extension.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClientIp(pub Option<String>);

fn set_header(response: &mut Response, name: &'static str, value: u64) {
    if let Ok(value) = HeaderValue::from_str(&value.to_string()) {
        response.headers_mut().insert(name, value);
    }
}

fn too_many_requests(retry_after: u64) -> Response {
    let mut response = (
        StatusCode::TOO_MANY_REQUESTS,
        Json(RateLimitedResponse {
            error: "too many requests".to_string(),
            retry_after,
        }),
    )
        .into_response();
    set_header(&mut response, HEADER_RETRY_AFTER, retry_after);
    response
}

pub async fn rate_limit(
    State(state): State<AppState>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let ip = resolve_client_ip(
        request.headers(),
        state.gateway.trusted_proxy_header(),
        peer,
    );
    let path = request.uri().path().to_string();

    let decision = match ip.as_deref() {
        Some(ip) => state.limiter.evaluate(ip, &path).await,
        None if is_scanner_probe(&path) => Decision::NotFound,
        None => {
            debug!(path, "No client IP; skipping rate limit");
            Decision::Unchecked
        }
    };

    request.extensions_mut().insert(ClientIp(ip.clone()));

    match decision {
        Decision::NotFound => StatusCode::NOT_FOUND.into_response(),
        Decision::Forbidden => {
            warn!(ip = ip.as_deref().unwrap_or("-"), path, "Blacklisted IP rejected");
            error_response(StatusCode::FORBIDDEN, "forbidden")
        }
        Decision::Banned { retry_after } => too_many_requests(retry_after),
        Decision::Limited {
            limit,
            retry_after,
            auto_banned,
        } => {
            warn!(
                ip = ip.as_deref().unwrap_or("-"),
                path,
                auto_banned,
                "Rate limit exceeded"
            );
            let mut response = too_many_requests(retry_after);
            set_header(&mut response, HEADER_LIMIT, limit);
            set_header(&mut response, HEADER_REMAINING, 0);
            set_header(&mut response, HEADER_RESET, retry_after);
            response
        }
        Decision::Allowed {
            limit,
            remaining,
            reset,
        } => {
            let mut response = next.run(request).await;
            set_header(&mut response, HEADER_LIMIT, limit);
            set_header(&mut response, HEADER_REMAINING, remaining);
            set_header(&mut response, HEADER_RESET, reset);
            response
        }
        Decision::Bypass | Decision::Unchecked => next.run(request).await,
    }
}
