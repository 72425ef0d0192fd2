use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    Failure,
}

impl AttemptOutcome {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "success" => Some(Self::Success),
            "failure" => Some(Self::Failure),
            _ => None,
        }
    }
}

/// Append-only login attempt log entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoginAttempt {
    pub id: Uuid,
    pub identifier: String,
    pub ip: Option<String>,
    pub outcome: AttemptOutcome,
    pub reason: Option<String>,
    pub attempted_at: DateTime<Utc>,
}

/// Subject of a lockout: an account identifier or a client IP.
///
/// Both run the same state machine against separate tables and thresholds.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum LockoutTarget {
    Account(String),
    Ip(String),
}

impl LockoutTarget {
    #[must_use]
    pub fn value(&self) -> &str {
        match self {
            Self::Account(identifier) => identifier,
            Self::Ip(ip) => ip,
        }
    }

    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Account(_) => "account",
            Self::Ip(_) => "ip",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Lockout {
    pub id: Uuid,
    pub target: LockoutTarget,
    pub failed_count: u32,
    pub locked_at: DateTime<Utc>,
    pub unlock_at: DateTime<Utc>,
    pub reason: String,
    pub manual_unlock_at: Option<DateTime<Utc>>,
    pub unlocked_by: Option<String>,
}

impl Lockout {
    /// A lockout is authoritative until it expires or an operator closes it.
    #[must_use]
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.manual_unlock_at.is_none() && self.unlock_at > now
    }

    #[must_use]
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        if self.is_active(now) {
            self.unlock_at - now
        } else {
            Duration::zero()
        }
    }

    /// Whole minutes left, rounded up so "0 minutes" is never shown while locked.
    #[must_use]
    pub fn minutes_remaining(&self, now: DateTime<Utc>) -> i64 {
        let seconds = self.remaining(now).num_seconds();
        if seconds <= 0 {
            0
        } else {
            (seconds + 59) / 60
        }
    }
}
