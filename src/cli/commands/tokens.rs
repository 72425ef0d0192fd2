use clap::{Arg, ArgMatches, Command};
use secrecy::SecretString;

use crate::api::state::{DEFAULT_REFRESH_COOKIE_NAME, DEFAULT_REFRESH_COOKIE_PATH};
use crate::clock::MAX_DURATION_SECONDS;
use crate::tokens::{DEFAULT_ACCESS_TTL_SECONDS, DEFAULT_REFRESH_TTL_SECONDS};

pub const ARG_JWT_SECRET: &str = "jwt-secret";
pub const ARG_JWT_ISSUER: &str = "jwt-issuer";
pub const ARG_ACCESS_TTL_SECONDS: &str = "access-ttl-seconds";
pub const ARG_REFRESH_TTL_SECONDS: &str = "refresh-ttl-seconds";
pub const ARG_COOKIE_NAME: &str = "cookie-name";
pub const ARG_COOKIE_PATH: &str = "cookie-path";
pub const ARG_COOKIE_SECURE: &str = "cookie-secure";

#[derive(Debug, Clone)]
pub struct Options {
    pub jwt_secret: SecretString,
    pub jwt_issuer: String,
    pub access_ttl_seconds: i64,
    pub refresh_ttl_seconds: i64,
    pub cookie_name: String,
    pub cookie_path: String,
    pub cookie_secure: bool,
}

impl Options {
    /// Parse token and cookie arguments from matches.
    ///
    /// # Errors
    /// Returns an error if the secret is missing or a TTL is not positive or
    /// longer than ten years.
    pub fn parse(matches: &ArgMatches) -> anyhow::Result<Self> {
        let jwt_secret = matches
            .get_one::<String>(ARG_JWT_SECRET)
            .filter(|v| !v.trim().is_empty())
            .map(|v| SecretString::from(v.clone()))
            .ok_or_else(|| anyhow::anyhow!("missing required argument: --{ARG_JWT_SECRET}"))?;

        let read_ttl = |id: &str, default: i64| -> anyhow::Result<i64> {
            let ttl = matches.get_one::<i64>(id).copied().unwrap_or(default);
            if ttl <= 0 {
                anyhow::bail!("--{id} must be positive");
            }
            if ttl > MAX_DURATION_SECONDS {
                anyhow::bail!("--{id} must not exceed {MAX_DURATION_SECONDS} seconds");
            }
            Ok(ttl)
        };

        Ok(Self {
            jwt_secret,
            jwt_issuer: matches
                .get_one::<String>(ARG_JWT_ISSUER)
                .cloned()
                .unwrap_or_else(|| crate::tokens::access::DEFAULT_ISSUER.to_string()),
            access_ttl_seconds: read_ttl(ARG_ACCESS_TTL_SECONDS, DEFAULT_ACCESS_TTL_SECONDS)?,
            refresh_ttl_seconds: read_ttl(ARG_REFRESH_TTL_SECONDS, DEFAULT_REFRESH_TTL_SECONDS)?,
            cookie_name: matches
                .get_one::<String>(ARG_COOKIE_NAME)
                .cloned()
                .unwrap_or_else(|| DEFAULT_REFRESH_COOKIE_NAME.to_string()),
            cookie_path: matches
                .get_one::<String>(ARG_COOKIE_PATH)
                .cloned()
                .unwrap_or_else(|| DEFAULT_REFRESH_COOKIE_PATH.to_string()),
            cookie_secure: matches
                .get_one::<bool>(ARG_COOKIE_SECURE)
                .copied()
                .unwrap_or(true),
        })
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_JWT_SECRET)
                .long(ARG_JWT_SECRET)
                .help("HMAC secret used to sign access tokens")
                .env("BULWARK_JWT_SECRET")
                .hide_env_values(true)
                .required(true),
        )
        .arg(
            Arg::new(ARG_JWT_ISSUER)
                .long(ARG_JWT_ISSUER)
                .help("Issuer claim for access tokens")
                .env("BULWARK_JWT_ISSUER")
                .default_value(crate::tokens::access::DEFAULT_ISSUER),
        )
        .arg(
            Arg::new(ARG_ACCESS_TTL_SECONDS)
                .long(ARG_ACCESS_TTL_SECONDS)
                .help("Access token TTL in seconds")
                .env("BULWARK_ACCESS_TTL_SECONDS")
                .default_value("900")
                .value_parser(clap::value_parser!(i64)),
        )
        .arg(
            Arg::new(ARG_REFRESH_TTL_SECONDS)
                .long(ARG_REFRESH_TTL_SECONDS)
                .help("Refresh token TTL in seconds")
                .env("BULWARK_REFRESH_TTL_SECONDS")
                .default_value("2592000")
                .value_parser(clap::value_parser!(i64)),
        )
        .arg(
            Arg::new(ARG_COOKIE_NAME)
                .long(ARG_COOKIE_NAME)
                .help("Name of the refresh token cookie")
                .env("BULWARK_COOKIE_NAME")
                .default_value(DEFAULT_REFRESH_COOKIE_NAME),
        )
        .arg(
            Arg::new(ARG_COOKIE_PATH)
                .long(ARG_COOKIE_PATH)
                .help("Path scope of the refresh token cookie")
                .env("BULWARK_COOKIE_PATH")
                .default_value(DEFAULT_REFRESH_COOKIE_PATH),
        )
        .arg(
            Arg::new(ARG_COOKIE_SECURE)
                .long(ARG_COOKIE_SECURE)
                .help("Mark the refresh cookie Secure (disable only for plain-HTTP development)")
                .env("BULWARK_COOKIE_SECURE")
                .default_value("true")
                .value_parser(clap::value_parser!(bool)),
        )
}
