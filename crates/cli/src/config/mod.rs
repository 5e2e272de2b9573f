//! Command line configuration

use std::path::PathBuf;

use clap::Parser;

use crate::config::{engine::EngineArgs, observability::LoggingConfig};

pub(crate) mod engine;
pub(crate) mod observability;

/// Passbook scenario runner configuration
#[derive(Debug, Parser)]
#[command(
    name = "passbook",
    about = "Replay a booking scenario against the passbook engine",
    long_about = None
)]
pub struct CliConfig {
    /// Scenario file to replay
    #[arg(short, long, env = "PASSBOOK_SCENARIO")]
    pub scenario: PathBuf,

    /// Engine tunables.
    #[command(flatten)]
    pub engine: EngineArgs,

    /// Logging output settings.
    #[command(flatten)]
    pub logging: LoggingConfig,
}

impl CliConfig {
    /// Load configuration from environment and CLI arguments
    ///
    /// # Errors
    ///
    /// Returns an error if configuration cannot be parsed
    pub fn load() -> Result<Self, clap::Error> {
        // Load .env file if present (ignore if missing)
        _ = dotenvy::dotenv();

        Self::try_parse()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use testresult::TestResult;

    use super::*;

    #[test]
    fn defaults_match_engine_defaults() -> TestResult {
        let config = CliConfig::try_parse_from(["passbook", "--scenario", "basic.yaml"])?;
        let engine = config.engine.engine_config();

        assert_eq!(config.scenario, PathBuf::from("basic.yaml"));
        assert_eq!(engine, passbook_app::config::EngineConfig::default());

        Ok(())
    }

    #[test]
    fn engine_flags_override_defaults() -> TestResult {
        let config = CliConfig::try_parse_from([
            "passbook",
            "--scenario",
            "basic.yaml",
            "--lock-timeout-ms",
            "250",
            "--retry-max-attempts",
            "7",
            "--auto-use-delay-hours",
            "24",
        ])?;
        let engine = config.engine.engine_config();

        assert_eq!(engine.lock_timeout, Duration::from_millis(250));
        assert_eq!(engine.retry.max_attempts, 7);
        assert_eq!(engine.auto_use_delay, jiff::SignedDuration::from_hours(24));

        Ok(())
    }

    #[test]
    fn scenario_is_required() {
        let result = CliConfig::try_parse_from(["passbook"]);

        assert!(result.is_err(), "expected a missing scenario to be refused");
    }
}
