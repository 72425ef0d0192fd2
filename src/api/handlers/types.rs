//! Request/response types for the auth and admin endpoints.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use utoipa::{IntoParams, ToSchema};

use crate::rules::RuleKind;

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct LoginRequest {
    pub identifier: String,
    pub password: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: i64,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct ErrorResponse {
    pub error: String,
}

/// Body of 423 responses.
#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct LockedResponse {
    pub error: String,
    pub minutes_remaining: i64,
}

/// Body of 429 responses.
#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct RateLimitedResponse {
    pub error: String,
    pub retry_after: u64,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct SessionResponse {
    pub user_id: String,
    pub tenant_id: String,
    pub role: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct RevokedResponse {
    pub revoked: u64,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct UnlockAccountRequest {
    pub identifier: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct UnlockIpRequest {
    pub ip: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct UnlockResponse {
    pub unlocked: u64,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct CreateIpRuleRequest {
    pub ip: String,
    pub kind: RuleKind,
    pub reason: String,
    /// Omit for a permanent rule.
    pub expires_in_seconds: Option<i64>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct DeactivateIpRuleRequest {
    pub ip: String,
    pub kind: RuleKind,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct DeactivateResponse {
    pub deactivated: u64,
}

#[derive(Deserialize, Debug, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct IpRuleQuery {
    /// `whitelist`, `blacklist` or `auto_banned`.
    pub kind: Option<RuleKind>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rule_requests_accept_snake_case_kinds() {
        let request: CreateIpRuleRequest = serde_json::from_value(serde_json::json!({
            "ip": "203.0.113.7",
            "kind": "auto_banned",
            "reason": "manual ban",
        }))
        .unwrap();
        assert_eq!(request.kind, RuleKind::AutoBanned);
        assert!(request.metadata.is_empty());
        assert!(request.expires_in_seconds.is_none());
    }
}
