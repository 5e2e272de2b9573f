//! Passbook scenario runner
//!
//! Replays a YAML booking scenario against the in-memory engine on a
//! controlled clock and prints what happened to every step, wallet and stock.

use std::{io, process, sync::Arc};

use passbook::{clock::FixedClock, policy::LatestExpiration};
use passbook_app::{context::AppContext, engine::Engine};
use tracing::{error, info};

use crate::{
    config::CliConfig,
    scenario::{Runner, Scenario},
};

mod config;
mod observability;
mod report;
mod scenario;

/// Passbook scenario runner entry point
#[tokio::main]
pub async fn main() {
    // Load configuration from .env and CLI arguments
    let config = CliConfig::load().unwrap_or_else(|e| {
        // Help and version requests exit successfully through clap
        e.exit();
    });

    if let Err(e) = observability::init(&config.logging) {
        #[expect(
            clippy::print_stderr,
            reason = "logging not initialized, must use eprintln for init errors"
        )]
        {
            eprintln!("Logging error: {e}");
        }

        process::exit(1);
    }

    let scenario = match Scenario::load(&config.scenario) {
        Ok(scenario) => scenario,
        Err(load_error) => {
            error!(path = %config.scenario.display(), "failed to load scenario: {load_error}");

            process::exit(1);
        }
    };

    let clock = Arc::new(FixedClock::new(scenario.start));
    let engine = Engine::new(
        config.engine.engine_config(),
        clock.clone(),
        Arc::new(LatestExpiration),
    );

    let mut runner = Runner::new(AppContext::new(engine), clock);

    let report = match runner.run(&scenario).await {
        Ok(report) => report,
        Err(run_error) => {
            error!("scenario aborted: {run_error}");

            process::exit(1);
        }
    };

    if let Err(write_error) = report.write_to(io::stdout().lock()) {
        error!("{write_error}");

        process::exit(1);
    }

    let unexpected = report.unexpected().count();

    if unexpected > 0 {
        error!(unexpected, "scenario did not go as expected");

        process::exit(2);
    }

    info!(steps = report.steps.len(), "scenario replayed");
}
