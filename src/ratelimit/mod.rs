//! Request rate limiting and IP auto-ban enforcement.

pub mod counter;
pub mod policy;
pub mod probe;

pub use counter::{
    CounterError, CounterStore, FallbackCounterStore, MemoryCounterStore, RedisCounterStore,
};
pub use policy::{Decision, RateLimitConfig, RateLimitPolicy};

use axum::http::HeaderMap;
use std::net::{IpAddr, SocketAddr};

/// Resolve the client IP from the trusted proxy header, falling back to the
/// socket peer.
///
/// For list-valued headers such as `x-forwarded-for` the first (client-most)
/// entry wins. Values that do not parse as an IP address are ignored.
#[must_use]
pub fn resolve_client_ip(
    headers: &HeaderMap,
    trusted_header: Option<&str>,
    peer: Option<SocketAddr>,
) -> Option<String> {
    let forwarded = trusted_header
        .and_then(|name| headers.get(name))
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .and_then(|value| value.parse::<IpAddr>().ok());

    forwarded
        .or_else(|| peer.map(|addr| addr.ip()))
        .map(|ip| ip.to_string())
}
