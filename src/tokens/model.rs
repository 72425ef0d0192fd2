use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// Why a refresh token or access token stopped being valid.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum RevocationReason {
    Rotated,
    Logout,
    LogoutAll,
    PasswordChange,
    ReuseDetected,
    Administrative,
}

impl RevocationReason {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rotated => "rotated",
            Self::Logout => "logout",
            Self::LogoutAll => "logout_all",
            Self::PasswordChange => "password_change",
            Self::ReuseDetected => "reuse_detected",
            Self::Administrative => "administrative",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "rotated" => Some(Self::Rotated),
            "logout" => Some(Self::Logout),
            "logout_all" => Some(Self::LogoutAll),
            "password_change" => Some(Self::PasswordChange),
            "reuse_detected" => Some(Self::ReuseDetected),
            "administrative" => Some(Self::Administrative),
            _ => None,
        }
    }
}

/// Device and network metadata captured when a refresh token is minted.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClientInfo {
    pub device_info: Option<String>,
    pub ip: Option<String>,
}

impl ClientInfo {
    #[must_use]
    pub fn new(device_info: Option<String>, ip: Option<String>) -> Self {
        Self { device_info, ip }
    }
}

/// Persisted refresh token. Only the SHA-256 of the raw value is kept.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RefreshTokenRecord {
    pub id: Uuid,
    pub token_hash: Vec<u8>,
    pub user_id: Uuid,
    pub tenant_id: Uuid,
    pub family_id: Uuid,
    pub device_info: Option<String>,
    pub ip: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub revocation_reason: Option<RevocationReason>,
    pub replaced_by: Option<Uuid>,
}

impl RefreshTokenRecord {
    #[must_use]
    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }

    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Revoked access token, kept until the token would have expired on its own.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlacklistEntry {
    pub jti: String,
    pub user_id: Uuid,
    pub expires_at: DateTime<Utc>,
    pub reason: RevocationReason,
    pub created_at: DateTime<Utc>,
}
