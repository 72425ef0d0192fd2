//! Refresh token cookie handling.

use axum::http::{
    header::{InvalidHeaderValue, COOKIE},
    HeaderMap, HeaderValue,
};

use crate::api::state::GatewayConfig;

/// Build the `HttpOnly` cookie carrying the raw refresh token.
pub(crate) fn refresh_cookie(
    config: &GatewayConfig,
    token: &str,
    ttl_seconds: i64,
) -> Result<HeaderValue, InvalidHeaderValue> {
    let mut cookie = format!(
        "{}={token}; Path={}; HttpOnly; SameSite=Strict; Max-Age={ttl_seconds}",
        config.cookie_name(),
        config.cookie_path()
    );
    if config.cookie_secure() {
        cookie.push_str("; Secure");
    }
    HeaderValue::from_str(&cookie)
}

pub(crate) fn clear_refresh_cookie(
    config: &GatewayConfig,
) -> Result<HeaderValue, InvalidHeaderValue> {
    let mut cookie = format!(
        "{}=; Path={}; HttpOnly; SameSite=Strict; Max-Age=0",
        config.cookie_name(),
        config.cookie_path()
    );
    if config.cookie_secure() {
        cookie.push_str("; Secure");
    }
    HeaderValue::from_str(&cookie)
}

pub(crate) fn extract_refresh_token(headers: &HeaderMap, config: &GatewayConfig) -> Option<String> {
    for header in headers.get_all(COOKIE) {
        let Ok(value) = header.to_str() else {
            continue;
        };
        for pair in value.split(';') {
            let mut parts = pair.trim().splitn(2, '=');
            let (Some(key), Some(val)) = (parts.next(), parts.next()) else {
                continue;
            };
            let val = val.trim();
            if key.trim() == config.cookie_name() && !val.is_empty() {
                return Some(val.to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cookie_attributes() {
        let config = GatewayConfig::default();
        let cookie = refresh_cookie(&config, "abc", 60).unwrap();
        assert_eq!(
            cookie.to_str().unwrap(),
            "bulwark_refresh=abc; Path=/v1/auth; HttpOnly; SameSite=Strict; Max-Age=60; Secure"
        );

        let cleared = clear_refresh_cookie(&config.with_cookie_secure(false)).unwrap();
        assert_eq!(
            cleared.to_str().unwrap(),
            "bulwark_refresh=; Path=/v1/auth; HttpOnly; SameSite=Strict; Max-Age=0"
        );
    }

    #[test]
    fn token_is_found_among_other_cookies() {
        let config = GatewayConfig::default();
        let mut headers = HeaderMap::new();
        headers.insert(
            COOKIE,
            HeaderValue::from_static("theme=dark; bulwark_refresh=tok123; lang=en"),
        );
        assert_eq!(
            extract_refresh_token(&headers, &config),
            Some("tok123".to_string())
        );

        headers.insert(COOKIE, HeaderValue::from_static("bulwark_refresh="));
        assert_eq!(extract_refresh_token(&headers, &config), None);
    }
}
