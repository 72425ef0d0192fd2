//! Login, refresh, logout and session endpoints.
//!
//! Flow Overview:
//! 1) Login checks existing lockouts, verifies the password through the user
//!    store, records the outcome and applies new lockouts on failure.
//! 2) A successful login starts a refresh token family (httpOnly cookie) and
//!    returns a short-lived access token.
//! 3) Refresh rotates the cookie; any rejection clears it and answers with the
//!    same generic 401 so a replay reveals nothing.
//! 4) Logout blacklists the presented access token and revokes the refresh
//!    token's family.

pub(crate) mod cookie;

use axum::{
    extract::Extension,
    http::{
        header::{SET_COOKIE, USER_AGENT},
        HeaderMap, StatusCode,
    },
    response::{IntoResponse, Json, Response},
};
use tracing::{error, info};

use self::cookie::{clear_refresh_cookie, extract_refresh_token, refresh_cookie};
use super::types::{
    ErrorResponse, LockedResponse, LoginRequest, RevokedResponse, SessionResponse, TokenResponse,
};
use super::{
    authenticate, error_response, extract_bearer_token, locked_response, unauthorized,
    unavailable, valid_identifier,
};
use crate::api::middleware::ClientIp;
use crate::api::state::{AppState, GatewayConfig};
use crate::lockout::AttemptOutcome;
use crate::store::StoreError;
use crate::tokens::{AccessTokenError, ClientInfo, RevocationReason, TokenError};
use crate::users::{normalize_identifier, verify_dummy_password, User};

const REASON_INVALID_CREDENTIALS: &str = "invalid_credentials";
const REASON_ACCOUNT_LOCKED: &str = "account_locked";

#[derive(Debug, thiserror::Error)]
enum LoginFailure {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Token(#[from] TokenError),
    #[error(transparent)]
    Access(#[from] AccessTokenError),
}

impl IntoResponse for LoginFailure {
    fn into_response(self) -> Response {
        match self {
            Self::Store(_) | Self::Token(TokenError::Store(_)) => unavailable(),
            _ => error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error"),
        }
    }
}

fn device_info(headers: &HeaderMap) -> Option<String> {
    headers
        .get(USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.chars().take(255).collect())
}

fn with_cleared_cookie(mut response: Response, config: &GatewayConfig) -> Response {
    if let Ok(cookie) = clear_refresh_cookie(config) {
        response.headers_mut().insert(SET_COOKIE, cookie);
    }
    response
}

/// Access token body plus the rotated refresh cookie.
fn token_response(
    state: &AppState,
    user: &User,
    refresh_token: &str,
) -> Result<Response, AccessTokenError> {
    let (access_token, _claims) = state.access.issue(user)?;
    let body = TokenResponse {
        access_token,
        token_type: "Bearer".to_string(),
        expires_in: state.access.ttl_seconds(),
    };
    let mut response = (StatusCode::OK, Json(body)).into_response();
    match refresh_cookie(
        &state.gateway,
        refresh_token,
        state.tokens.config().refresh_ttl_seconds(),
    ) {
        Ok(cookie) => {
            response.headers_mut().insert(SET_COOKIE, cookie);
        }
        Err(err) => error!("Failed to build refresh cookie: {err}"),
    }
    Ok(response)
}

#[utoipa::path(
    post,
    path = "/v1/auth/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Login success; refresh cookie set", body = TokenResponse),
        (status = 400, description = "Validation error", body = ErrorResponse),
        (status = 401, description = "Invalid credentials", body = ErrorResponse),
        (status = 423, description = "Account or IP locked", body = LockedResponse),
        (status = 429, description = "Rate limited", body = super::types::RateLimitedResponse),
        (status = 503, description = "Security store unavailable", body = ErrorResponse)
    ),
    tag = "auth"
)]
pub async fn login(
    headers: HeaderMap,
    Extension(state): Extension<AppState>,
    Extension(client_ip): Extension<ClientIp>,
    payload: Option<Json<LoginRequest>>,
) -> Response {
    let Some(Json(request)) = payload else {
        return error_response(StatusCode::BAD_REQUEST, "missing payload");
    };
    let identifier = normalize_identifier(&request.identifier);
    if !valid_identifier(&identifier) || request.password.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "invalid identifier or password");
    }

    let client = ClientInfo::new(device_info(&headers), client_ip.0);
    match attempt_login(&state, &identifier, &request.password, &client).await {
        Ok(response) => response,
        Err(err) => {
            error!("Login failed for {identifier}: {err}");
            err.into_response()
        }
    }
}

async fn attempt_login(
    state: &AppState,
    identifier: &str,
    password: &str,
    client: &ClientInfo,
) -> Result<Response, LoginFailure> {
    let ip = client.ip.as_deref();

    // A locked IP is turned away before anything is recorded.
    if let Some(ip) = ip {
        if let Some(info) = state.lockouts.ip_lockout(ip).await? {
            return Ok(locked_response(&info));
        }
    }

    // Attempts against a locked account still count towards the IP threshold.
    if let Some(info) = state.lockouts.account_lockout(identifier).await? {
        state
            .lockouts
            .record_attempt(
                identifier,
                ip,
                AttemptOutcome::Failure,
                Some(REASON_ACCOUNT_LOCKED),
            )
            .await?;
        let outcome = state.lockouts.check_and_apply_lockout(identifier, ip).await?;
        let info = outcome.longest().cloned().unwrap_or(info);
        return Ok(locked_response(&info));
    }

    let user = state.users.get_active_by_identifier(identifier).await?;
    let verified = match &user {
        Some(user) => state.users.verify_password(user, password).await?,
        None => {
            verify_dummy_password(password).await;
            false
        }
    };

    let Some(user) = user.filter(|_| verified) else {
        state
            .lockouts
            .record_attempt(
                identifier,
                ip,
                AttemptOutcome::Failure,
                Some(REASON_INVALID_CREDENTIALS),
            )
            .await?;
        let outcome = state.lockouts.check_and_apply_lockout(identifier, ip).await?;
        return Ok(match outcome.longest() {
            Some(info) => locked_response(info),
            None => unauthorized(),
        });
    };

    state
        .lockouts
        .record_attempt(identifier, ip, AttemptOutcome::Success, None)
        .await?;
    let (refresh_token, record) = state
        .tokens
        .issue_initial_token(user.id, user.tenant_id, client)
        .await?;
    info!(user_id = %user.id, family_id = %record.family_id, "Login succeeded");
    Ok(token_response(state, &user, &refresh_token)?)
}

#[utoipa::path(
    post,
    path = "/v1/auth/refresh",
    responses(
        (status = 200, description = "Rotated; new refresh cookie set", body = TokenResponse),
        (status = 401, description = "Refresh token rejected", body = ErrorResponse),
        (status = 503, description = "Token store unavailable", body = ErrorResponse)
    ),
    tag = "auth"
)]
pub async fn refresh(
    headers: HeaderMap,
    Extension(state): Extension<AppState>,
    Extension(client_ip): Extension<ClientIp>,
) -> Response {
    let Some(raw_token) = extract_refresh_token(&headers, &state.gateway) else {
        return with_cleared_cookie(unauthorized(), &state.gateway);
    };
    let client = ClientInfo::new(device_info(&headers), client_ip.0);

    let (next_token, record) = match state.tokens.rotate(&raw_token, &client).await {
        Ok(rotated) => rotated,
        Err(TokenError::NotFound | TokenError::Expired | TokenError::Reused) => {
            return with_cleared_cookie(unauthorized(), &state.gateway);
        }
        Err(TokenError::Store(err)) => {
            error!("Token store unavailable during refresh: {err}");
            return with_cleared_cookie(unavailable(), &state.gateway);
        }
        Err(err @ TokenError::Generation(_)) => {
            error!("Failed to rotate refresh token: {err}");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error");
        }
    };

    let user = match state.users.get_by_id(record.user_id).await {
        Ok(Some(user)) if user.active => user,
        Ok(_) => {
            // The account went away; end the session rather than extend it.
            if let Err(err) = state.tokens.revoke_session(&next_token).await {
                error!("Failed to revoke session of inactive user: {err}");
            }
            return with_cleared_cookie(unauthorized(), &state.gateway);
        }
        Err(err) => {
            error!("User lookup failed during refresh: {err}");
            return with_cleared_cookie(unavailable(), &state.gateway);
        }
    };

    match token_response(&state, &user, &next_token) {
        Ok(response) => response,
        Err(err) => {
            error!("Failed to issue access token: {err}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}

#[utoipa::path(
    post,
    path = "/v1/auth/logout",
    responses(
        (status = 204, description = "Session revoked and cookie cleared"),
        (status = 503, description = "Token store unavailable", body = ErrorResponse)
    ),
    tag = "auth"
)]
pub async fn logout(headers: HeaderMap, Extension(state): Extension<AppState>) -> Response {
    let mut failed = false;

    if let Some(token) = extract_bearer_token(&headers) {
        // Signature and expiry are enough here; re-blacklisting is idempotent.
        if let Ok(claims) = state.access.verify(&token) {
            if let Err(err) = state
                .tokens
                .blacklist(
                    &claims.jti,
                    claims.sub,
                    claims.expires_at(),
                    RevocationReason::Logout,
                )
                .await
            {
                error!("Failed to blacklist access token on logout: {err}");
                failed = true;
            }
        }
    }

    if let Some(raw_token) = extract_refresh_token(&headers, &state.gateway) {
        if let Err(err) = state.tokens.revoke_session(&raw_token).await {
            error!("Failed to revoke refresh token on logout: {err}");
            failed = true;
        }
    }

    // Always clear the cookie, even if revocation failed.
    let response = if failed {
        unavailable()
    } else {
        StatusCode::NO_CONTENT.into_response()
    };
    with_cleared_cookie(response, &state.gateway)
}

#[utoipa::path(
    post,
    path = "/v1/auth/logout-all",
    responses(
        (status = 200, description = "Every session of the user revoked", body = RevokedResponse),
        (status = 401, description = "Missing or invalid access token", body = ErrorResponse),
        (status = 503, description = "Token store unavailable", body = ErrorResponse)
    ),
    security(("bearer" = [])),
    tag = "auth"
)]
pub async fn logout_all(headers: HeaderMap, Extension(state): Extension<AppState>) -> Response {
    let claims = match authenticate(&headers, &state).await {
        Ok(claims) => claims,
        Err(response) => return response,
    };

    let revoked = match state
        .tokens
        .revoke_all_for_user(claims.sub, RevocationReason::LogoutAll)
        .await
    {
        Ok(revoked) => revoked,
        Err(err) => {
            error!("Failed to revoke sessions for {}: {err}", claims.sub);
            return unavailable();
        }
    };

    if let Err(err) = state
        .tokens
        .blacklist(
            &claims.jti,
            claims.sub,
            claims.expires_at(),
            RevocationReason::LogoutAll,
        )
        .await
    {
        error!("Failed to blacklist access token on logout-all: {err}");
        return with_cleared_cookie(unavailable(), &state.gateway);
    }

    with_cleared_cookie(
        (StatusCode::OK, Json(RevokedResponse { revoked })).into_response(),
        &state.gateway,
    )
}

#[utoipa::path(
    get,
    path = "/v1/auth/session",
    responses(
        (status = 200, description = "Access token is valid", body = SessionResponse),
        (status = 401, description = "Missing, invalid or revoked access token", body = ErrorResponse)
    ),
    security(("bearer" = [])),
    tag = "auth"
)]
pub async fn session(headers: HeaderMap, Extension(state): Extension<AppState>) -> Response {
    match authenticate(&headers, &state).await {
        Ok(claims) => {
            let response = SessionResponse {
                user_id: claims.sub.to_string(),
                tenant_id: claims.tid.to_string(),
                role: claims.role.clone(),
                expires_at: claims.expires_at(),
            };
            (StatusCode::OK, Json(response)).into_response()
        }
        Err(response) => response,
    }
}
