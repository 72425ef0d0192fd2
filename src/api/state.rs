//! Components shared by the middleware and the handlers.
//!
//! Everything is built once at start-up and handed to the router; there are
//! no process-wide singletons.

use std::sync::Arc;

use crate::clock::Clock;
use crate::lockout::LockoutEngine;
use crate::ratelimit::RateLimitPolicy;
use crate::rules::RuleBook;
use crate::tokens::{AccessTokenIssuer, TokenManager};
use crate::users::UserStore;

pub const DEFAULT_REFRESH_COOKIE_NAME: &str = "bulwark_refresh";
pub const DEFAULT_REFRESH_COOKIE_PATH: &str = "/v1/auth";

#[derive(Clone, Debug)]
pub struct GatewayConfig {
    trusted_proxy_header: Option<String>,
    cookie_name: String,
    cookie_path: String,
    cookie_secure: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            trusted_proxy_header: None,
            cookie_name: DEFAULT_REFRESH_COOKIE_NAME.to_string(),
            cookie_path: DEFAULT_REFRESH_COOKIE_PATH.to_string(),
            cookie_secure: true,
        }
    }
}

impl GatewayConfig {
    /// Header carrying the client IP, set by a proxy we trust. Empty disables it.
    #[must_use]
    pub fn with_trusted_proxy_header(mut self, header: Option<String>) -> Self {
        self.trusted_proxy_header = header
            .map(|header| header.trim().to_ascii_lowercase())
            .filter(|header| !header.is_empty());
        self
    }

    #[must_use]
    pub fn with_cookie_name(mut self, name: String) -> Self {
        self.cookie_name = name;
        self
    }

    #[must_use]
    pub fn with_cookie_path(mut self, path: String) -> Self {
        self.cookie_path = path;
        self
    }

    /// Only disable for plain-HTTP local development.
    #[must_use]
    pub fn with_cookie_secure(mut self, secure: bool) -> Self {
        self.cookie_secure = secure;
        self
    }

    #[must_use]
    pub fn trusted_proxy_header(&self) -> Option<&str> {
        self.trusted_proxy_header.as_deref()
    }

    #[must_use]
    pub fn cookie_name(&self) -> &str {
        &self.cookie_name
    }

    #[must_use]
    pub fn cookie_path(&self) -> &str {
        &self.cookie_path
    }

    #[must_use]
    pub fn cookie_secure(&self) -> bool {
        self.cookie_secure
    }
}

#[derive(Clone)]
pub struct AppState {
    pub users: Arc<dyn UserStore>,
    pub tokens: Arc<TokenManager>,
    pub access: Arc<AccessTokenIssuer>,
    pub lockouts: Arc<LockoutEngine>,
    pub rules: Arc<RuleBook>,
    pub limiter: Arc<RateLimitPolicy>,
    pub clock: Arc<dyn Clock>,
    pub gateway: Arc<GatewayConfig>,
}
