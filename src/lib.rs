//! # Bulwark (session, lockout and rate-limit trust boundary)
//!
//! `bulwark` sits between clients and the identity owner. It issues and
//! rotates refresh tokens, throttles password guessing and rate limits
//! abusive IPs before a request reaches a handler.
//!
//! ## Token Lifecycle
//!
//! Every login starts a refresh token **family**. Refreshing revokes the
//! presented token and issues its successor in the same family. Presenting a
//! token that was already rotated means it leaked: the whole family is revoked
//! and the caller gets a generic `401`. Access tokens are short-lived JWTs;
//! logout blacklists their `jti` until they expire on their own.
//!
//! ## Lockouts
//!
//! Failed logins are counted per account identifier and per client IP inside a
//! rolling window. Crossing a threshold locks the target with a duration that
//! doubles on each repeat offence (capped). Locked requests get `423` with the
//! minutes remaining. Whitelisted IPs are never IP-locked.
//!
//! ## Rate Limiting & Auto-Ban
//!
//! Each IP gets a fixed-window request counter, shared through Redis when
//! configured and kept in process otherwise. Going over the limit records a
//! violation; enough violations within an hour turn into a temporary ban.
//! Scanner probes are answered `404` without touching any store. Counter
//! failures never block traffic, while token validation fails closed.

pub mod api;
pub mod cache;
pub mod cli;
pub mod clock;
pub mod jobs;
pub mod lockout;
pub mod ratelimit;
pub mod rules;
pub mod store;
pub mod tokens;
pub mod users;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};
