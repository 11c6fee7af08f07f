//! wardend - privilege-separated collection daemon
//!
//! Loads the configuration, builds the module registry and runs the stage
//! pipeline on one set of shared resources.

mod cli;
mod output;

use clap::Parser;
use cli::Cli;
use nix::unistd;
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use warden::{modules, spawner, Pipeline, Result, SharedResources, WardenConfig, WardenError};

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cli.log_level())),
        )
        .with_target(false)
        .init();

    match run(&cli) {
        Ok(code) => code,
        Err(e) => {
            error!("{}", e);
            eprintln!("wardend: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<ExitCode> {
    let config = WardenConfig::resolve(cli.config.as_deref())?;
    let registry = modules::standard_registry(&config)?;
    let pipeline = Pipeline::standard();

    if cli.dry_run {
        output::print_registry(&registry);
        output::print_plan(&pipeline);
        return Ok(ExitCode::SUCCESS);
    }

    output::print_banner(cli.silent);
    ensure_single_threaded()?;
    if !unistd::geteuid().is_root() {
        warn!("Not running as root: workers can only keep the current identity");
    }

    // Resources are released (and SIGCHLD unblocked) before the exit status
    // is reported, whichever way the run ended.
    let outcome = {
        let mut resources = SharedResources::new()?;
        pipeline.run(&mut resources, &registry, &config.executor_config())
    };

    output::print_outcome(&outcome, cli.silent);
    let code = outcome.exit_code();
    info!("Exiting with status {}", code);
    Ok(if code == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Workers run Rust code after `fork` without `exec`, which is only sound
/// when no other thread could hold a lock at fork time.
fn ensure_single_threaded() -> Result<()> {
    let threads = spawner::thread_count()
        .map_err(|e| WardenError::ProcessState(format!("cannot count threads: {e}")))?;
    if threads != 1 {
        return Err(WardenError::ProcessState(format!(
            "{threads} threads running; workers must be forked from a single-threaded process"
        )));
    }
    Ok(())
}
