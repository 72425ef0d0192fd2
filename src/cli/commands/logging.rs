use clap::{builder::ValueParser, Arg, ArgMatches, Command};

use crate::cli::telemetry::{LogFormat, TelemetryConfig, DEFAULT_SERVICE_NAME};

pub const ARG_VERBOSITY: &str = "verbosity";
pub const ARG_LOG_JSON: &str = "log-json";
pub const ARG_SERVICE_NAME: &str = "service-name";
pub const ARG_INSTANCE_ID: &str = "instance-id";
pub const ARG_ENVIRONMENT: &str = "environment";

#[must_use]
pub fn validator_log_level() -> ValueParser {
    ValueParser::from(move |level: &str| -> std::result::Result<u8, String> {
        if let Ok(parsed) = level.parse::<u8>() {
            if parsed <= 5 {
                return Ok(parsed);
            }
        }

        match level.to_lowercase().as_str() {
            "error" => Ok(0),
            "warn" => Ok(1),
            "info" => Ok(2),
            "debug" => Ok(3),
            "trace" => Ok(4),
            _ => Err("invalid log level".to_string()),
        }
    })
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_VERBOSITY)
                .short('v')
                .long("verbose")
                .help("Verbosity level: ERROR, WARN, INFO, DEBUG, TRACE (default: ERROR)")
                .env("BULWARK_LOG_LEVEL")
                .global(true)
                .action(clap::ArgAction::Count)
                .value_parser(validator_log_level()),
        )
        .arg(
            Arg::new(ARG_LOG_JSON)
                .long(ARG_LOG_JSON)
                .help("Emit logs as JSON lines instead of the pretty format")
                .env("BULWARK_LOG_JSON")
                .global(true)
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new(ARG_SERVICE_NAME)
                .long(ARG_SERVICE_NAME)
                .help("Service name reported with exported traces")
                .env("BULWARK_SERVICE_NAME")
                .default_value(DEFAULT_SERVICE_NAME)
                .global(true),
        )
        .arg(
            Arg::new(ARG_INSTANCE_ID)
                .long(ARG_INSTANCE_ID)
                .help("Replica id reported with exported traces")
                .long_help(
                    "Replica id reported with exported traces. Falls back to OTEL_SERVICE_INSTANCE_ID, then to a random ULID per process.",
                )
                .env("BULWARK_INSTANCE_ID")
                .global(true),
        )
        .arg(
            Arg::new(ARG_ENVIRONMENT)
                .long(ARG_ENVIRONMENT)
                .help("Deployment environment, e.g. production or staging")
                .env("BULWARK_ENVIRONMENT")
                .global(true),
        )
}

/// Telemetry settings from the parsed arguments.
#[must_use]
pub fn telemetry_config(matches: &ArgMatches) -> TelemetryConfig {
    let format = if matches.get_flag(ARG_LOG_JSON) {
        LogFormat::Json
    } else {
        LogFormat::Pretty
    };
    TelemetryConfig {
        format,
        service_name: matches
            .get_one::<String>(ARG_SERVICE_NAME)
            .cloned()
            .unwrap_or_else(|| DEFAULT_SERVICE_NAME.to_string()),
        instance_id: matches.get_one::<String>(ARG_INSTANCE_ID).cloned(),
        environment: matches.get_one::<String>(ARG_ENVIRONMENT).cloned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_flag_counts() {
        temp_env::with_var_unset("BULWARK_LOG_LEVEL", || {
            let command = with_args(Command::new("bulwark"));
            let matches = command.get_matches_from(vec!["bulwark", "-vvv"]);
            assert_eq!(matches.get_one::<u8>(ARG_VERBOSITY).copied(), Some(3));
        });
    }

    #[test]
    fn json_from_env() {
        temp_env::with_var("BULWARK_LOG_JSON", Some("true"), || {
            let command = with_args(Command::new("bulwark"));
            let matches = command.get_matches_from(vec!["bulwark"]);
            assert!(matches.get_flag(ARG_LOG_JSON));
        });
    }

    #[test]
    fn telemetry_identity_from_env() {
        temp_env::with_vars(
            [
                ("BULWARK_LOG_JSON", Some("true")),
                ("BULWARK_SERVICE_NAME", None),
                ("BULWARK_INSTANCE_ID", Some("edge-2")),
                ("BULWARK_ENVIRONMENT", Some("production")),
            ],
            || {
                let command = with_args(Command::new("bulwark"));
                let matches = command.get_matches_from(vec!["bulwark"]);
                let config = telemetry_config(&matches);
                assert_eq!(config.format, LogFormat::Json);
                assert_eq!(config.service_name, "bulwark");
                assert_eq!(config.instance_id.as_deref(), Some("edge-2"));
                assert_eq!(config.environment.as_deref(), Some("production"));
            },
        );
    }

    #[test]
    fn telemetry_flags_override_defaults() {
        temp_env::with_vars_unset(
            [
                "BULWARK_LOG_JSON",
                "BULWARK_SERVICE_NAME",
                "BULWARK_INSTANCE_ID",
                "BULWARK_ENVIRONMENT",
            ],
            || {
                let command = with_args(Command::new("bulwark"));
                let matches = command.get_matches_from(vec![
                    "bulwark",
                    "--service-name",
                    "bulwark-edge",
                ]);
                let config = telemetry_config(&matches);
                assert_eq!(config.format, LogFormat::Pretty);
                assert_eq!(config.service_name, "bulwark-edge");
                assert!(config.instance_id.is_none());
                assert!(config.environment.is_none());
            },
        );
    }
}
