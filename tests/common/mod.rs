#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{header, Request, Response, StatusCode},
    Router,
};
use bulwark::{
    api::{self, AppState, GatewayConfig},
    clock::{Clock, ManualClock, OsRandom},
    lockout::{LockoutConfig, LockoutEngine},
    ratelimit::{MemoryCounterStore, RateLimitConfig, RateLimitPolicy},
    rules::{EscalationConfig, RuleBook},
    store::{MemoryStore, StoreError, TokenStore},
    tokens::{
        AccessTokenIssuer, BlacklistEntry, RefreshTokenRecord, RevocationReason, TokenConfig,
        TokenManager,
    },
    users::{MemoryUserStore, User, ROLE_ADMIN, ROLE_USER},
};
use chrono::{DateTime, TimeZone, Utc};
use http_body_util::BodyExt;
use secrecy::SecretString;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tower::ServiceExt;
use uuid::Uuid;

pub const PASSWORD: &str = "correct horse battery staple";
pub const USER_IDENTIFIER: &str = "a@x.com";
pub const ADMIN_IDENTIFIER: &str = "ops@x.com";
pub const ADMIN_IP: &str = "192.0.2.10";

pub struct Harness {
    pub app: Router,
    pub state: AppState,
    pub clock: Arc<ManualClock>,
    pub store: Arc<MemoryStore>,
    pub token_store: Arc<SwitchableTokenStore>,
    pub counters: Arc<MemoryCounterStore>,
    pub user: User,
    pub admin: User,
}

pub fn harness() -> Harness {
    harness_with_limit(100)
}

pub fn harness_with_limit(limit: u64) -> Harness {
    let start = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
    let clock = Arc::new(ManualClock::new(start));
    let dyn_clock: Arc<dyn Clock> = clock.clone();
    let store = Arc::new(MemoryStore::new());

    let users = Arc::new(MemoryUserStore::new());
    let tenant = Uuid::new_v4();
    let user = users
        .add_user(tenant, USER_IDENTIFIER, PASSWORD, ROLE_USER)
        .unwrap();
    let admin = users
        .add_user(tenant, ADMIN_IDENTIFIER, PASSWORD, ROLE_ADMIN)
        .unwrap();

    let rules = Arc::new(RuleBook::new(
        store.clone(),
        dyn_clock.clone(),
        EscalationConfig::default(),
    ));
    let lockouts = Arc::new(LockoutEngine::new(
        store.clone(),
        rules.clone(),
        dyn_clock.clone(),
        LockoutConfig::default(),
    ));
    let token_store = Arc::new(SwitchableTokenStore::new(store.clone()));
    let tokens = Arc::new(TokenManager::new(
        token_store.clone(),
        dyn_clock.clone(),
        Arc::new(OsRandom),
        TokenConfig::default(),
    ));
    let access = Arc::new(AccessTokenIssuer::new(
        &SecretString::from("integration-test-secret".to_string()),
        "bulwark",
        900,
        dyn_clock.clone(),
    ));
    let counters = Arc::new(MemoryCounterStore::new(dyn_clock.clone()));
    let limiter = Arc::new(RateLimitPolicy::new(
        counters.clone(),
        rules.clone(),
        dyn_clock.clone(),
        RateLimitConfig::default().with_limit(limit),
    ));
    let gateway = GatewayConfig::default()
        .with_trusted_proxy_header(Some("x-forwarded-for".to_string()))
        .with_cookie_secure(false);

    let state = AppState {
        users,
        tokens,
        access,
        lockouts,
        rules,
        limiter,
        clock: dyn_clock,
        gateway: Arc::new(gateway),
    };

    Harness {
        app: api::app(state.clone()),
        state,
        clock,
        store,
        token_store,
        counters,
        user,
        admin,
    }
}

/// Token store that delegates to memory until taken offline.
pub struct SwitchableTokenStore {
    inner: Arc<MemoryStore>,
    offline: AtomicBool,
    rotation_offline: AtomicBool,
}

impl SwitchableTokenStore {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            offline: AtomicBool::new(false),
            rotation_offline: AtomicBool::new(false),
        }
    }

    /// Fail every call.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Fail only the rotation write.
    pub fn set_rotation_offline(&self, offline: bool) {
        self.rotation_offline.store(offline, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("token store offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl TokenStore for SwitchableTokenStore {
    async fn insert_refresh_token(&self, record: &RefreshTokenRecord) -> Result<(), StoreError> {
        self.check()?;
        self.inner.insert_refresh_token(record).await
    }

    async fn find_refresh_token(
        &self,
        token_hash: &[u8],
    ) -> Result<Option<RefreshTokenRecord>, StoreError> {
        self.check()?;
        self.inner.find_refresh_token(token_hash).await
    }

    async fn rotate_refresh_token(
        &self,
        old_id: Uuid,
        replacement: &RefreshTokenRecord,
        revoked_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.check()?;
        if self.rotation_offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("rotation write failed".to_string()));
        }
        self.inner
            .rotate_refresh_token(old_id, replacement, revoked_at)
            .await
    }

    async fn revoke_family(
        &self,
        family_id: Uuid,
        revoked_at: DateTime<Utc>,
        reason: RevocationReason,
    ) -> Result<u64, StoreError> {
        self.check()?;
        self.inner.revoke_family(family_id, revoked_at, reason).await
    }

    async fn revoke_user_tokens(
        &self,
        user_id: Uuid,
        revoked_at: DateTime<Utc>,
        reason: RevocationReason,
    ) -> Result<u64, StoreError> {
        self.check()?;
        self.inner.revoke_user_tokens(user_id, revoked_at, reason).await
    }

    async fn family_tokens(&self, family_id: Uuid) -> Result<Vec<RefreshTokenRecord>, StoreError> {
        self.check()?;
        self.inner.family_tokens(family_id).await
    }

    async fn delete_expired_refresh_tokens(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        self.check()?;
        self.inner.delete_expired_refresh_tokens(now).await
    }

    async fn insert_blacklist_entry(&self, entry: &BlacklistEntry) -> Result<(), StoreError> {
        self.check()?;
        self.inner.insert_blacklist_entry(entry).await
    }

    async fn blacklist_entry_exists(&self, jti: &str) -> Result<bool, StoreError> {
        self.check()?;
        self.inner.blacklist_entry_exists(jti).await
    }

    async fn delete_expired_blacklist_entries(
        &self,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        self.check()?;
        self.inner.delete_expired_blacklist_entries(now).await
    }
}

pub fn get(path: &str, ip: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(path)
        .header("x-forwarded-for", ip)
        .body(Body::empty())
        .unwrap()
}

pub fn post_json(path: &str, ip: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(path)
        .header("x-forwarded-for", ip)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub fn login_request(identifier: &str, password: &str, ip: &str) -> Request<Body> {
    post_json(
        "/v1/auth/login",
        ip,
        &json!({ "identifier": identifier, "password": password }),
    )
}

pub fn with_bearer(mut request: Request<Body>, token: &str) -> Request<Body> {
    request.headers_mut().insert(
        header::AUTHORIZATION,
        format!("Bearer {token}").parse().unwrap(),
    );
    request
}

pub fn with_refresh_cookie(mut request: Request<Body>, token: &str) -> Request<Body> {
    request.headers_mut().insert(
        header::COOKIE,
        format!("bulwark_refresh={token}").parse().unwrap(),
    );
    request
}

pub async fn send(app: &Router, request: Request<Body>) -> Response<Body> {
    app.clone().oneshot(request).await.unwrap()
}

pub async fn body_json(response: Response<Body>) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap_or(Value::Null)
}

pub fn header_str<'a>(response: &'a Response<Body>, name: &str) -> Option<&'a str> {
    response
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
}

/// Refresh token carried by the response's `Set-Cookie`, or `""` when cleared.
pub fn refresh_cookie(response: &Response<Body>) -> Option<String> {
    let cookie = header_str(response, "set-cookie")?;
    let pair = cookie.split(';').next()?;
    pair.strip_prefix("bulwark_refresh=").map(ToString::to_string)
}

/// Log in and return `(access_token, refresh_token)`.
pub async fn login(app: &Router, identifier: &str, ip: &str) -> (String, String) {
    let response = send(app, login_request(identifier, PASSWORD, ip)).await;
    assert_eq!(response.status(), StatusCode::OK);
    let refresh = refresh_cookie(&response).unwrap();
    let body = body_json(response).await;
    let access = body["access_token"].as_str().unwrap().to_string();
    (access, refresh)
}
