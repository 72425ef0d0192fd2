//! Operator endpoints: manual unlocks and IP rule management.
//!
//! Every route requires an access token with the `admin` role. The acting
//! user's id is recorded as `unlocked_by` / `created_by`.

use axum::{
    extract::{Extension, Query},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use chrono::Duration;
use std::net::IpAddr;
use tracing::{error, info};

use super::types::{
    CreateIpRuleRequest, DeactivateIpRuleRequest, DeactivateResponse, ErrorResponse, IpRuleQuery,
    UnlockAccountRequest, UnlockIpRequest, UnlockResponse,
};
use super::{authenticate, error_response, unavailable, valid_identifier};
use crate::api::state::AppState;
use crate::rules::{IpRule, NewIpRule};
use crate::tokens::AccessClaims;
use crate::users::{normalize_identifier, ROLE_ADMIN};

async fn require_admin(headers: &HeaderMap, state: &AppState) -> Result<AccessClaims, Response> {
    let claims = authenticate(headers, state).await?;
    if claims.role == ROLE_ADMIN {
        Ok(claims)
    } else {
        Err(error_response(StatusCode::FORBIDDEN, "forbidden"))
    }
}

/// Canonical text form of an IP, or `None` if it does not parse.
fn canonical_ip(ip: &str) -> Option<String> {
    ip.trim().parse::<IpAddr>().ok().map(|ip| ip.to_string())
}

#[utoipa::path(
    post,
    path = "/v1/admin/lockouts/account/unlock",
    request_body = UnlockAccountRequest,
    responses(
        (status = 200, description = "Active account lockouts closed", body = UnlockResponse),
        (status = 400, description = "Validation error", body = ErrorResponse),
        (status = 401, description = "Unauthorized", body = ErrorResponse),
        (status = 403, description = "Admin role required", body = ErrorResponse)
    ),
    security(("bearer" = [])),
    tag = "admin"
)]
pub async fn unlock_account(
    headers: HeaderMap,
    Extension(state): Extension<AppState>,
    payload: Option<Json<UnlockAccountRequest>>,
) -> Response {
    let claims = match require_admin(&headers, &state).await {
        Ok(claims) => claims,
        Err(response) => return response,
    };
    let Some(Json(request)) = payload else {
        return error_response(StatusCode::BAD_REQUEST, "missing payload");
    };
    let identifier = normalize_identifier(&request.identifier);
    if !valid_identifier(&identifier) {
        return error_response(StatusCode::BAD_REQUEST, "invalid identifier");
    }

    match state
        .lockouts
        .unlock_account(&identifier, &claims.sub.to_string())
        .await
    {
        Ok(unlocked) => (StatusCode::OK, Json(UnlockResponse { unlocked })).into_response(),
        Err(err) => {
            error!("Failed to unlock account {identifier}: {err}");
            unavailable()
        }
    }
}

#[utoipa::path(
    post,
    path = "/v1/admin/lockouts/ip/unlock",
    request_body = UnlockIpRequest,
    responses(
        (status = 200, description = "Active IP lockouts closed", body = UnlockResponse),
        (status = 400, description = "Validation error", body = ErrorResponse),
        (status = 401, description = "Unauthorized", body = ErrorResponse),
        (status = 403, description = "Admin role required", body = ErrorResponse)
    ),
    security(("bearer" = [])),
    tag = "admin"
)]
pub async fn unlock_ip(
    headers: HeaderMap,
    Extension(state): Extension<AppState>,
    payload: Option<Json<UnlockIpRequest>>,
) -> Response {
    let claims = match require_admin(&headers, &state).await {
        Ok(claims) => claims,
        Err(response) => return response,
    };
    let Some(Json(request)) = payload else {
        return error_response(StatusCode::BAD_REQUEST, "missing payload");
    };
    let Some(ip) = canonical_ip(&request.ip) else {
        return error_response(StatusCode::BAD_REQUEST, "invalid ip");
    };

    match state.lockouts.unlock_ip(&ip, &claims.sub.to_string()).await {
        Ok(unlocked) => {
            state.limiter.reset(&ip).await;
            (StatusCode::OK, Json(UnlockResponse { unlocked })).into_response()
        }
        Err(err) => {
            error!("Failed to unlock ip {ip}: {err}");
            unavailable()
        }
    }
}

#[utoipa::path(
    get,
    path = "/v1/admin/ip-rules",
    params(IpRuleQuery),
    responses(
        (status = 200, description = "Active IP rules", body = [IpRule]),
        (status = 401, description = "Unauthorized", body = ErrorResponse),
        (status = 403, description = "Admin role required", body = ErrorResponse)
    ),
    security(("bearer" = [])),
    tag = "admin"
)]
pub async fn list_ip_rules(
    headers: HeaderMap,
    Extension(state): Extension<AppState>,
    Query(query): Query<IpRuleQuery>,
) -> Response {
    if let Err(response) = require_admin(&headers, &state).await {
        return response;
    }
    match state.rules.list(query.kind).await {
        Ok(rules) => (StatusCode::OK, Json(rules)).into_response(),
        Err(err) => {
            error!("Failed to list ip rules: {err}");
            unavailable()
        }
    }
}

#[utoipa::path(
    post,
    path = "/v1/admin/ip-rules",
    request_body = CreateIpRuleRequest,
    responses(
        (status = 200, description = "Rule created or refreshed", body = IpRule),
        (status = 400, description = "Validation error", body = ErrorResponse),
        (status = 401, description = "Unauthorized", body = ErrorResponse),
        (status = 403, description = "Admin role required", body = ErrorResponse)
    ),
    security(("bearer" = [])),
    tag = "admin"
)]
pub async fn create_ip_rule(
    headers: HeaderMap,
    Extension(state): Extension<AppState>,
    payload: Option<Json<CreateIpRuleRequest>>,
) -> Response {
    let claims = match require_admin(&headers, &state).await {
        Ok(claims) => claims,
        Err(response) => return response,
    };
    let Some(Json(request)) = payload else {
        return error_response(StatusCode::BAD_REQUEST, "missing payload");
    };
    let Some(ip) = canonical_ip(&request.ip) else {
        return error_response(StatusCode::BAD_REQUEST, "invalid ip");
    };
    if request.reason.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "reason is required");
    }
    let expires_at = match request.expires_in_seconds {
        Some(seconds) if seconds <= 0 => {
            return error_response(StatusCode::BAD_REQUEST, "expires_in_seconds must be positive");
        }
        Some(seconds) => {
            let expires_at = Duration::try_seconds(seconds)
                .and_then(|ttl| state.clock.now().checked_add_signed(ttl));
            let Some(expires_at) = expires_at else {
                return error_response(StatusCode::BAD_REQUEST, "expires_in_seconds out of range");
            };
            Some(expires_at)
        }
        None => None,
    };

    let rule = NewIpRule::new(ip.clone(), request.kind, request.reason.trim())
        .with_expires_at(expires_at)
        .with_created_by(claims.sub.to_string())
        .with_metadata(request.metadata);

    match state.rules.upsert(&rule).await {
        Ok(saved) => {
            info!(
                ip = %saved.ip,
                kind = saved.kind.as_str(),
                created_by = %claims.sub,
                "IP rule saved"
            );
            (StatusCode::OK, Json(saved)).into_response()
        }
        Err(err) => {
            error!("Failed to save ip rule for {ip}: {err}");
            unavailable()
        }
    }
}

#[utoipa::path(
    post,
    path = "/v1/admin/ip-rules/deactivate",
    request_body = DeactivateIpRuleRequest,
    responses(
        (status = 200, description = "Matching active rules deactivated", body = DeactivateResponse),
        (status = 400, description = "Validation error", body = ErrorResponse),
        (status = 401, description = "Unauthorized", body = ErrorResponse),
        (status = 403, description = "Admin role required", body = ErrorResponse)
    ),
    security(("bearer" = [])),
    tag = "admin"
)]
pub async fn deactivate_ip_rule(
    headers: HeaderMap,
    Extension(state): Extension<AppState>,
    payload: Option<Json<DeactivateIpRuleRequest>>,
) -> Response {
    let claims = match require_admin(&headers, &state).await {
        Ok(claims) => claims,
        Err(response) => return response,
    };
    let Some(Json(request)) = payload else {
        return error_response(StatusCode::BAD_REQUEST, "missing payload");
    };
    let Some(ip) = canonical_ip(&request.ip) else {
        return error_response(StatusCode::BAD_REQUEST, "invalid ip");
    };

    match state.rules.deactivate(&ip, request.kind).await {
        Ok(deactivated) => {
            info!(
                ip = %ip,
                kind = request.kind.as_str(),
                deactivated,
                by = %claims.sub,
                "IP rule deactivated"
            );
            (StatusCode::OK, Json(DeactivateResponse { deactivated })).into_response()
        }
        Err(err) => {
            error!("Failed to deactivate ip rule for {ip}: {err}");
            unavailable()
        }
    }
}
