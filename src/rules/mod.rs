//! IP rules and rate-limit violation records shared by the lockout engine and
//! the rate-limit policy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use utoipa::ToSchema;
use uuid::Uuid;

pub mod book;

pub use book::{EscalationConfig, IpRuleSet, RuleBook, ViolationOutcome};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    Whitelist,
    Blacklist,
    AutoBanned,
}

impl RuleKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Whitelist => "whitelist",
            Self::Blacklist => "blacklist",
            Self::AutoBanned => "auto_banned",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "whitelist" => Some(Self::Whitelist),
            "blacklist" => Some(Self::Blacklist),
            "auto_banned" => Some(Self::AutoBanned),
            _ => None,
        }
    }
}

/// What caused an automatic ban.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct BanTrigger {
    pub endpoint: String,
    pub violations: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct IpRule {
    pub id: Uuid,
    pub ip: String,
    pub kind: RuleKind,
    pub reason: String,
    pub trigger: Option<BanTrigger>,
    /// `None` means the rule never expires.
    pub expires_at: Option<DateTime<Utc>>,
    pub active: bool,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub metadata: BTreeMap<String, String>,
}

impl IpRule {
    #[must_use]
    pub fn is_effective(&self, now: DateTime<Utc>) -> bool {
        self.active && self.expires_at.map_or(true, |expires_at| expires_at > now)
    }

    /// Seconds until the rule lapses, `None` for permanent rules.
    #[must_use]
    pub fn remaining_seconds(&self, now: DateTime<Utc>) -> Option<u64> {
        self.expires_at
            .map(|expires_at| u64::try_from((expires_at - now).num_seconds().max(0)).unwrap_or(0))
    }
}

/// Input for creating or refreshing a rule.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewIpRule {
    pub ip: String,
    pub kind: RuleKind,
    pub reason: String,
    pub trigger: Option<BanTrigger>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_by: String,
    pub metadata: BTreeMap<String, String>,
}

impl NewIpRule {
    #[must_use]
    pub fn new(ip: impl Into<String>, kind: RuleKind, reason: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            kind,
            reason: reason.into(),
            trigger: None,
            expires_at: None,
            created_by: "system".to_string(),
            metadata: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_trigger(mut self, trigger: BanTrigger) -> Self {
        self.trigger = Some(trigger);
        self
    }

    #[must_use]
    pub fn with_expires_at(mut self, expires_at: Option<DateTime<Utc>>) -> Self {
        self.expires_at = expires_at;
        self
    }

    #[must_use]
    pub fn with_created_by(mut self, created_by: impl Into<String>) -> Self {
        self.created_by = created_by.into();
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: BTreeMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Aggregated violation counter per IP and endpoint, updated in place.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct RateLimitViolation {
    pub ip: String,
    pub endpoint: String,
    pub count: u32,
    pub first_violation_at: DateTime<Utc>,
    pub last_violation_at: DateTime<Utc>,
    pub auto_banned: bool,
}
