//! Map validated CLI arguments to the action the binary executes.

use crate::cli::actions::{server::Args, Action};
use crate::cli::commands::{limits, storage, tokens, ARG_DSN, ARG_PORT, ARG_REDIS_URL};
use anyhow::Result;

/// Map validated CLI matches to a server action.
///
/// # Errors
/// Returns an error if required arguments are missing or inconsistent.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let port = matches.get_one::<u16>(ARG_PORT).copied().unwrap_or(8080);
    let optional = |id: &str| {
        matches
            .get_one::<String>(id)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    };

    Ok(Action::Server(Box::new(Args {
        port,
        dsn: optional(ARG_DSN),
        redis_url: optional(ARG_REDIS_URL),
        tokens: tokens::Options::parse(matches)?,
        limits: limits::Options::parse(matches)?,
        storage: storage::Options::parse(matches)?,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_dsn_means_memory() {
        temp_env::with_vars(
            [
                ("BULWARK_DSN", Some("  ")),
                ("BULWARK_REDIS_URL", None),
                ("BULWARK_JWT_SECRET", Some("s3cr3t")),
            ],
            || {
                let matches = crate::cli::commands::new().get_matches_from(vec!["bulwark"]);
                let action = handler(&matches);
                assert!(action.is_ok());
                if let Ok(Action::Server(args)) = action {
                    assert_eq!(args.port, 8080);
                    assert_eq!(args.dsn, None);
                    assert_eq!(args.redis_url, None);
                }
            },
        );
    }

    #[test]
    fn invalid_limits_are_reported() {
        temp_env::with_vars(
            [
                ("BULWARK_JWT_SECRET", Some("s3cr3t")),
                ("BULWARK_BAN_SECONDS", Some("0")),
            ],
            || {
                let matches = crate::cli::commands::new().get_matches_from(vec!["bulwark"]);
                let result = handler(&matches);
                assert!(result.is_err());
                if let Err(err) = result {
                    assert!(err.to_string().contains("--ban-seconds must be positive"));
                }
            },
        );
    }
}
