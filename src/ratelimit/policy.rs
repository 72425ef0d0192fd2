//! Per-request gateway decision: probe filter, IP rules, then the counter.
//!
//! Store failures never block traffic here. A rule lookup that fails is
//! treated as "no rules"; a counter that fails lets the request through
//! without rate-limit headers.

use std::sync::Arc;
use tracing::{debug, error, warn};

use super::counter::CounterStore;
use super::probe::is_scanner_probe;
use crate::clock::{Clock, MAX_DURATION_SECONDS};
use crate::rules::{IpRuleSet, RuleBook};

pub const DEFAULT_REQUEST_LIMIT: u64 = 100;
pub const DEFAULT_WINDOW_SECONDS: u64 = 60;
pub const GLOBAL_VIOLATION_ENDPOINT: &str = "global";

#[derive(Clone, Debug)]
pub struct RateLimitConfig {
    limit: u64,
    window_seconds: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            limit: DEFAULT_REQUEST_LIMIT,
            window_seconds: DEFAULT_WINDOW_SECONDS,
        }
    }
}

impl RateLimitConfig {
    #[must_use]
    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = limit.max(1);
        self
    }

    #[must_use]
    pub fn with_window_seconds(mut self, seconds: u64) -> Self {
        self.window_seconds = seconds.clamp(1, MAX_DURATION_SECONDS.unsigned_abs());
        self
    }

    #[must_use]
    pub fn limit(&self) -> u64 {
        self.limit
    }

    #[must_use]
    pub fn window_seconds(&self) -> u64 {
        self.window_seconds
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decision {
    /// Scanner probe; answer 404 without touching any store.
    NotFound,
    /// Whitelisted IP.
    Bypass,
    /// A store failed; let the request through undecorated.
    Unchecked,
    /// Blacklisted IP.
    Forbidden,
    /// Active auto-ban.
    Banned { retry_after: u64 },
    Allowed {
        limit: u64,
        remaining: u64,
        reset: u64,
    },
    Limited {
        limit: u64,
        retry_after: u64,
        auto_banned: bool,
    },
}

#[must_use]
pub fn counter_key(ip: &str) -> String {
    format!("rl:ip:{ip}")
}

pub struct RateLimitPolicy {
    counters: Arc<dyn CounterStore>,
    rules: Arc<RuleBook>,
    clock: Arc<dyn Clock>,
    config: RateLimitConfig,
}

impl RateLimitPolicy {
    #[must_use]
    pub fn new(
        counters: Arc<dyn CounterStore>,
        rules: Arc<RuleBook>,
        clock: Arc<dyn Clock>,
        config: RateLimitConfig,
    ) -> Self {
        Self {
            counters,
            rules,
            clock,
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    pub async fn evaluate(&self, ip: &str, path: &str) -> Decision {
        if is_scanner_probe(path) {
            debug!(ip, path, "Scanner probe rejected");
            return Decision::NotFound;
        }

        let rules = match self.rules.lookup(ip).await {
            Ok(rules) => rules,
            Err(err) => {
                warn!(ip, "IP rule lookup failed, continuing without rules: {err}");
                IpRuleSet::default()
            }
        };

        if let Some(decision) = self.apply_rules(&rules) {
            return decision;
        }

        self.count(ip).await
    }

    /// Clear the counter for `ip`, e.g. after an admin unlock.
    pub async fn reset(&self, ip: &str) {
        if let Err(err) = self.counters.reset(&counter_key(ip)).await {
            warn!(ip, "Failed to reset rate-limit counter: {err}");
        }
    }

    /// Requests counted for `ip` in the current window.
    pub async fn usage(&self, ip: &str) -> Option<u64> {
        match self.counters.get_count(&counter_key(ip)).await {
            Ok(count) => Some(count),
            Err(err) => {
                warn!(ip, "Failed to read rate-limit counter: {err}");
                None
            }
        }
    }

    fn apply_rules(&self, rules: &IpRuleSet) -> Option<Decision> {
        let now = self.clock.now();
        if rules.whitelist.as_ref().is_some_and(|rule| rule.is_effective(now)) {
            return Some(Decision::Bypass);
        }
        if rules.blacklist.as_ref().is_some_and(|rule| rule.is_effective(now)) {
            return Some(Decision::Forbidden);
        }
        rules
            .auto_ban
            .as_ref()
            .filter(|rule| rule.is_effective(now))
            .map(|rule| Decision::Banned {
                retry_after: rule
                    .remaining_seconds(now)
                    .unwrap_or_else(|| self.default_ban_seconds()),
            })
    }

    async fn count(&self, ip: &str) -> Decision {
        let key = counter_key(ip);
        let window = self.config.window_seconds;
        let limit = self.config.limit;

        let count = match self.counters.increment(&key, window).await {
            Ok(count) => count,
            Err(err) => {
                error!(ip, "Rate-limit counter unavailable, allowing request: {err}");
                return Decision::Unchecked;
            }
        };
        let reset = self
            .counters
            .retry_after(&key, window)
            .await
            .unwrap_or(window);

        if count <= limit {
            return Decision::Allowed {
                limit,
                remaining: limit - count,
                reset,
            };
        }

        match self.rules.record_violation(ip, GLOBAL_VIOLATION_ENDPOINT).await {
            Ok(outcome) => match outcome.ban {
                Some(ban) => Decision::Limited {
                    limit,
                    retry_after: ban
                        .remaining_seconds(self.clock.now())
                        .unwrap_or_else(|| self.default_ban_seconds()),
                    auto_banned: true,
                },
                None => Decision::Limited {
                    limit,
                    retry_after: reset.max(1),
                    auto_banned: false,
                },
            },
            Err(err) => {
                warn!(ip, "Failed to record rate-limit violation: {err}");
                Decision::Limited {
                    limit,
                    retry_after: reset.max(1),
                    auto_banned: false,
                }
            }
        }
    }

    fn default_ban_seconds(&self) -> u64 {
        u64::try_from(self.rules.config().ban_seconds()).unwrap_or(0)
    }
}
