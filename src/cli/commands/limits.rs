use clap::{Arg, ArgMatches, Command};

use crate::clock::MAX_DURATION_SECONDS;

pub const ARG_LOCKOUT_WINDOW_SECONDS: &str = "lockout-window-seconds";
pub const ARG_LOCKOUT_ACCOUNT_THRESHOLD: &str = "lockout-account-threshold";
pub const ARG_LOCKOUT_IP_THRESHOLD: &str = "lockout-ip-threshold";
pub const ARG_LOCKOUT_ACCOUNT_BASE_SECONDS: &str = "lockout-account-base-seconds";
pub const ARG_LOCKOUT_IP_BASE_SECONDS: &str = "lockout-ip-base-seconds";
pub const ARG_LOCKOUT_MAX_SECONDS: &str = "lockout-max-seconds";
pub const ARG_RATE_LIMIT_REQUESTS: &str = "rate-limit-requests";
pub const ARG_RATE_LIMIT_WINDOW_SECONDS: &str = "rate-limit-window-seconds";
pub const ARG_VIOLATION_THRESHOLD: &str = "violation-threshold";
pub const ARG_BAN_SECONDS: &str = "ban-seconds";
pub const ARG_TRUSTED_PROXY_HEADER: &str = "trusted-proxy-header";

#[derive(Debug, Clone)]
pub struct Options {
    pub lockout_window_seconds: i64,
    pub lockout_account_threshold: u32,
    pub lockout_ip_threshold: u32,
    pub lockout_account_base_seconds: i64,
    pub lockout_ip_base_seconds: i64,
    pub lockout_max_seconds: i64,
    pub rate_limit_requests: u64,
    pub rate_limit_window_seconds: u64,
    pub violation_threshold: u32,
    pub ban_seconds: i64,
    pub trusted_proxy_header: Option<String>,
}

impl Options {
    /// Parse lockout and rate-limit arguments from matches.
    ///
    /// # Errors
    /// Returns an error if a duration or threshold is zero or negative, or a
    /// duration is longer than ten years.
    pub fn parse(matches: &ArgMatches) -> anyhow::Result<Self> {
        let read_seconds = |id: &str| -> anyhow::Result<i64> {
            match matches.get_one::<i64>(id).copied() {
                Some(value) if value > MAX_DURATION_SECONDS => Err(anyhow::anyhow!(
                    "--{id} must not exceed {MAX_DURATION_SECONDS} seconds"
                )),
                Some(value) if value > 0 => Ok(value),
                Some(_) => Err(anyhow::anyhow!("--{id} must be positive")),
                None => Err(anyhow::anyhow!("missing required argument: --{id}")),
            }
        };
        let read_count = |id: &str| -> anyhow::Result<u32> {
            match matches.get_one::<u32>(id).copied() {
                Some(value) if value > 0 => Ok(value),
                Some(_) => Err(anyhow::anyhow!("--{id} must be positive")),
                None => Err(anyhow::anyhow!("missing required argument: --{id}")),
            }
        };
        let read_u64 = |id: &str| -> anyhow::Result<u64> {
            match matches.get_one::<u64>(id).copied() {
                Some(value) if value > 0 => Ok(value),
                Some(_) => Err(anyhow::anyhow!("--{id} must be positive")),
                None => Err(anyhow::anyhow!("missing required argument: --{id}")),
            }
        };

        let options = Self {
            lockout_window_seconds: read_seconds(ARG_LOCKOUT_WINDOW_SECONDS)?,
            lockout_account_threshold: read_count(ARG_LOCKOUT_ACCOUNT_THRESHOLD)?,
            lockout_ip_threshold: read_count(ARG_LOCKOUT_IP_THRESHOLD)?,
            lockout_account_base_seconds: read_seconds(ARG_LOCKOUT_ACCOUNT_BASE_SECONDS)?,
            lockout_ip_base_seconds: read_seconds(ARG_LOCKOUT_IP_BASE_SECONDS)?,
            lockout_max_seconds: read_seconds(ARG_LOCKOUT_MAX_SECONDS)?,
            rate_limit_requests: read_u64(ARG_RATE_LIMIT_REQUESTS)?,
            rate_limit_window_seconds: read_u64(ARG_RATE_LIMIT_WINDOW_SECONDS)?,
            violation_threshold: read_count(ARG_VIOLATION_THRESHOLD)?,
            ban_seconds: read_seconds(ARG_BAN_SECONDS)?,
            trusted_proxy_header: matches
                .get_one::<String>(ARG_TRUSTED_PROXY_HEADER)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty()),
        };

        if options.rate_limit_window_seconds > MAX_DURATION_SECONDS.unsigned_abs() {
            anyhow::bail!(
                "--{ARG_RATE_LIMIT_WINDOW_SECONDS} must not exceed {MAX_DURATION_SECONDS} seconds"
            );
        }

        if options.lockout_max_seconds < options.lockout_account_base_seconds
            || options.lockout_max_seconds < options.lockout_ip_base_seconds
        {
            anyhow::bail!("--{ARG_LOCKOUT_MAX_SECONDS} must not be shorter than a base duration");
        }

        Ok(options)
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    let command = with_lockout_args(command);
    with_rate_limit_args(command)
}

fn with_lockout_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_LOCKOUT_WINDOW_SECONDS)
                .long(ARG_LOCKOUT_WINDOW_SECONDS)
                .help("Rolling window in which failed logins are counted")
                .env("BULWARK_LOCKOUT_WINDOW_SECONDS")
                .default_value("900")
                .value_parser(clap::value_parser!(i64)),
        )
        .arg(
            Arg::new(ARG_LOCKOUT_ACCOUNT_THRESHOLD)
                .long(ARG_LOCKOUT_ACCOUNT_THRESHOLD)
                .help("Failed logins per account before it is locked")
                .env("BULWARK_LOCKOUT_ACCOUNT_THRESHOLD")
                .default_value("5")
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new(ARG_LOCKOUT_IP_THRESHOLD)
                .long(ARG_LOCKOUT_IP_THRESHOLD)
                .help("Failed logins per IP before it is locked")
                .env("BULWARK_LOCKOUT_IP_THRESHOLD")
                .default_value("10")
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new(ARG_LOCKOUT_ACCOUNT_BASE_SECONDS)
                .long(ARG_LOCKOUT_ACCOUNT_BASE_SECONDS)
                .help("First account lockout duration; doubles on repeat lockouts")
                .env("BULWARK_LOCKOUT_ACCOUNT_BASE_SECONDS")
                .default_value("1800")
                .value_parser(clap::value_parser!(i64)),
        )
        .arg(
            Arg::new(ARG_LOCKOUT_IP_BASE_SECONDS)
                .long(ARG_LOCKOUT_IP_BASE_SECONDS)
                .help("First IP lockout duration; doubles on repeat lockouts")
                .env("BULWARK_LOCKOUT_IP_BASE_SECONDS")
                .default_value("3600")
                .value_parser(clap::value_parser!(i64)),
        )
        .arg(
            Arg::new(ARG_LOCKOUT_MAX_SECONDS)
                .long(ARG_LOCKOUT_MAX_SECONDS)
                .help("Upper bound for any lockout duration")
                .env("BULWARK_LOCKOUT_MAX_SECONDS")
                .default_value("86400")
                .value_parser(clap::value_parser!(i64)),
        )
}

fn with_rate_limit_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_RATE_LIMIT_REQUESTS)
                .long(ARG_RATE_LIMIT_REQUESTS)
                .help("Requests allowed per IP in each window")
                .env("BULWARK_RATE_LIMIT_REQUESTS")
                .default_value("100")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new(ARG_RATE_LIMIT_WINDOW_SECONDS)
                .long(ARG_RATE_LIMIT_WINDOW_SECONDS)
                .help("Fixed rate-limit window in seconds")
                .env("BULWARK_RATE_LIMIT_WINDOW_SECONDS")
                .default_value("60")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new(ARG_VIOLATION_THRESHOLD)
                .long(ARG_VIOLATION_THRESHOLD)
                .help("Violations within an hour before an IP is auto-banned")
                .env("BULWARK_VIOLATION_THRESHOLD")
                .default_value("10")
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new(ARG_BAN_SECONDS)
                .long(ARG_BAN_SECONDS)
                .help("Auto-ban duration in seconds")
                .env("BULWARK_BAN_SECONDS")
                .default_value("86400")
                .value_parser(clap::value_parser!(i64)),
        )
        .arg(
            Arg::new(ARG_TRUSTED_PROXY_HEADER)
                .long(ARG_TRUSTED_PROXY_HEADER)
                .help("Header carrying the client IP, e.g. x-forwarded-for")
                .long_help(
                    "Header carrying the client IP, e.g. x-forwarded-for. Only set this when a trusted proxy overwrites it; otherwise the socket peer address is used.",
                )
                .env("BULWARK_TRUSTED_PROXY_HEADER"),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    const ENV: [&str; 11] = [
        "BULWARK_LOCKOUT_WINDOW_SECONDS",
        "BULWARK_LOCKOUT_ACCOUNT_THRESHOLD",
        "BULWARK_LOCKOUT_IP_THRESHOLD",
        "BULWARK_LOCKOUT_ACCOUNT_BASE_SECONDS",
        "BULWARK_LOCKOUT_IP_BASE_SECONDS",
        "BULWARK_LOCKOUT_MAX_SECONDS",
        "BULWARK_RATE_LIMIT_REQUESTS",
        "BULWARK_RATE_LIMIT_WINDOW_SECONDS",
        "BULWARK_VIOLATION_THRESHOLD",
        "BULWARK_BAN_SECONDS",
        "BULWARK_TRUSTED_PROXY_HEADER",
    ];

    #[test]
    fn defaults_match_policy() {
        temp_env::with_vars_unset(ENV, || {
            let matches = with_args(Command::new("bulwark")).get_matches_from(vec!["bulwark"]);
            let options = Options::parse(&matches);
            assert!(options.is_ok());
            if let Ok(options) = options {
                assert_eq!(options.lockout_window_seconds, 900);
                assert_eq!(options.lockout_account_threshold, 5);
                assert_eq!(options.lockout_ip_threshold, 10);
                assert_eq!(options.lockout_account_base_seconds, 1800);
                assert_eq!(options.lockout_ip_base_seconds, 3600);
                assert_eq!(options.rate_limit_requests, 100);
                assert_eq!(options.rate_limit_window_seconds, 60);
                assert_eq!(options.violation_threshold, 10);
                assert_eq!(options.ban_seconds, 86400);
                assert_eq!(options.trusted_proxy_header, None);
            }
        });
    }

    #[test]
    fn env_overrides() {
        temp_env::with_vars(
            [
                ("BULWARK_RATE_LIMIT_REQUESTS", Some("5")),
                ("BULWARK_TRUSTED_PROXY_HEADER", Some("X-Forwarded-For")),
            ],
            || {
                let matches = with_args(Command::new("bulwark")).get_matches_from(vec!["bulwark"]);
                let options = Options::parse(&matches);
                assert!(options.is_ok());
                if let Ok(options) = options {
                    assert_eq!(options.rate_limit_requests, 5);
                    assert_eq!(
                        options.trusted_proxy_header.as_deref(),
                        Some("X-Forwarded-For")
                    );
                }
            },
        );
    }

    #[test]
    fn zero_values_are_rejected() {
        temp_env::with_vars_unset(ENV, || {
            let matches = with_args(Command::new("bulwark")).get_matches_from(vec![
                "bulwark",
                "--lockout-account-threshold",
                "0",
            ]);
            assert!(Options::parse(&matches).is_err());

            let matches = with_args(Command::new("bulwark")).get_matches_from(vec![
                "bulwark",
                "--lockout-max-seconds",
                "60",
            ]);
            assert!(Options::parse(&matches).is_err());
        });
    }

    #[test]
    fn oversized_durations_are_rejected() {
        temp_env::with_vars_unset(ENV, || {
            let matches = with_args(Command::new("bulwark")).get_matches_from(vec![
                "bulwark",
                "--ban-seconds",
                "100000000000000",
            ]);
            let result = Options::parse(&matches);
            assert!(result.is_err());
            if let Err(err) = result {
                assert!(err.to_string().contains("--ban-seconds must not exceed"));
            }

            let matches = with_args(Command::new("bulwark")).get_matches_from(vec![
                "bulwark",
                "--rate-limit-window-seconds",
                "18446744073709551615",
            ]);
            assert!(Options::parse(&matches).is_err());

            let matches = with_args(Command::new("bulwark")).get_matches_from(vec![
                "bulwark",
                "--ban-seconds",
                "315360000",
                "--lockout-max-seconds",
                "315360000",
            ]);
            assert!(Options::parse(&matches).is_ok());
        });
    }
}
