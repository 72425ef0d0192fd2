use clap::{Arg, ArgMatches, Command};
use secrecy::SecretString;

pub const ARG_DB_MAX_CONNECTIONS: &str = "db-max-connections";
pub const ARG_STORE_TIMEOUT_MS: &str = "store-timeout-ms";
pub const ARG_REDIS_TIMEOUT_MS: &str = "redis-timeout-ms";
pub const ARG_CLEANUP_INTERVAL_SECONDS: &str = "cleanup-interval-seconds";
pub const ARG_RETENTION_DAYS: &str = "retention-days";
pub const ARG_COUNTER_SWEEP_SECONDS: &str = "counter-sweep-seconds";
pub const ARG_DEV_ADMIN_IDENTIFIER: &str = "dev-admin-identifier";
pub const ARG_DEV_ADMIN_PASSWORD: &str = "dev-admin-password";

#[derive(Debug, Clone)]
pub struct Options {
    pub db_max_connections: u32,
    pub store_timeout_ms: u64,
    pub redis_timeout_ms: u64,
    pub cleanup_interval_seconds: u64,
    pub retention_days: u32,
    pub counter_sweep_seconds: u64,
    /// Seeded into the in-memory user store when no DSN is configured.
    pub dev_admin: Option<(String, SecretString)>,
}

impl Options {
    /// Parse storage and background job arguments from matches.
    ///
    /// # Errors
    /// Returns an error if only one of the dev admin credentials is set.
    pub fn parse(matches: &ArgMatches) -> anyhow::Result<Self> {
        let read = |id: &str, default: u64| matches.get_one::<u64>(id).copied().unwrap_or(default);

        let identifier = matches
            .get_one::<String>(ARG_DEV_ADMIN_IDENTIFIER)
            .filter(|v| !v.trim().is_empty())
            .cloned();
        let password = matches
            .get_one::<String>(ARG_DEV_ADMIN_PASSWORD)
            .filter(|v| !v.is_empty())
            .map(|v| SecretString::from(v.clone()));
        let dev_admin = match (identifier, password) {
            (Some(identifier), Some(password)) => Some((identifier, password)),
            (None, None) => None,
            _ => anyhow::bail!(
                "--{ARG_DEV_ADMIN_IDENTIFIER} and --{ARG_DEV_ADMIN_PASSWORD} must be set together"
            ),
        };

        Ok(Self {
            db_max_connections: matches
                .get_one::<u32>(ARG_DB_MAX_CONNECTIONS)
                .copied()
                .unwrap_or(5),
            store_timeout_ms: read(ARG_STORE_TIMEOUT_MS, 2000),
            redis_timeout_ms: read(ARG_REDIS_TIMEOUT_MS, 250),
            cleanup_interval_seconds: read(ARG_CLEANUP_INTERVAL_SECONDS, 3600),
            retention_days: matches
                .get_one::<u32>(ARG_RETENTION_DAYS)
                .copied()
                .unwrap_or(30),
            counter_sweep_seconds: read(ARG_COUNTER_SWEEP_SECONDS, 60),
            dev_admin,
        })
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    let command = with_store_args(command);
    let command = with_job_args(command);
    with_dev_args(command)
}

fn with_store_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_DB_MAX_CONNECTIONS)
                .long(ARG_DB_MAX_CONNECTIONS)
                .help("Maximum Postgres pool size")
                .env("BULWARK_DB_MAX_CONNECTIONS")
                .default_value("5")
                .value_parser(clap::value_parser!(u32).range(1..)),
        )
        .arg(
            Arg::new(ARG_STORE_TIMEOUT_MS)
                .long(ARG_STORE_TIMEOUT_MS)
                .help("Deadline for each durable store call in milliseconds")
                .env("BULWARK_STORE_TIMEOUT_MS")
                .default_value("2000")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
        .arg(
            Arg::new(ARG_REDIS_TIMEOUT_MS)
                .long(ARG_REDIS_TIMEOUT_MS)
                .help("Deadline for each Redis counter call in milliseconds")
                .env("BULWARK_REDIS_TIMEOUT_MS")
                .default_value("250")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
}

fn with_job_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_CLEANUP_INTERVAL_SECONDS)
                .long(ARG_CLEANUP_INTERVAL_SECONDS)
                .help("Interval between cleanup passes in seconds")
                .env("BULWARK_CLEANUP_INTERVAL_SECONDS")
                .default_value("3600")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new(ARG_RETENTION_DAYS)
                .long(ARG_RETENTION_DAYS)
                .help("Days to keep login attempts, closed lockouts and violations")
                .env("BULWARK_RETENTION_DAYS")
                .default_value("30")
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new(ARG_COUNTER_SWEEP_SECONDS)
                .long(ARG_COUNTER_SWEEP_SECONDS)
                .help("Interval between sweeps of in-process rate-limit counters")
                .env("BULWARK_COUNTER_SWEEP_SECONDS")
                .default_value("60")
                .value_parser(clap::value_parser!(u64)),
        )
}

fn with_dev_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_DEV_ADMIN_IDENTIFIER)
                .long(ARG_DEV_ADMIN_IDENTIFIER)
                .help("Admin identifier seeded into the in-memory user store")
                .env("BULWARK_DEV_ADMIN_IDENTIFIER")
                .requires(ARG_DEV_ADMIN_PASSWORD),
        )
        .arg(
            Arg::new(ARG_DEV_ADMIN_PASSWORD)
                .long(ARG_DEV_ADMIN_PASSWORD)
                .help("Password for the seeded in-memory admin")
                .env("BULWARK_DEV_ADMIN_PASSWORD")
                .hide_env_values(true),
        )
}
