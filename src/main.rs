type Result<T> = color_eyre::eyre::Result<T>;

mod cli;

use clap::Parser;
use eyre::WrapErr;
use std::path::Path;
use tempfile::TempDir;
use tracing::{debug, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cli::{Cli, Config};
use sysprobe::cases::run_case;
use sysprobe::Reporter;

// Forked children must not race other runtime workers
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = Config::from_cli(cli)?;

    if config.list {
        for case in &config.cases {
            println!("{:<8} {}", case.name(), case.description());
        }
        return Ok(());
    }

    info!("sysprobe starting");

    let scratch = match &config.tmpdir {
        Some(base) => TempDir::new_in(base),
        None => TempDir::new(),
    }
    .wrap_err("Failed to create temporary directory")?;

    let mut reporter = Reporter::new();
    run_iterations(&config, scratch.path(), &mut reporter).await;

    info!("summary: {}", reporter.summary());
    let code = reporter.exit_code();

    // process::exit skips destructors
    scratch
        .close()
        .wrap_err("Failed to remove temporary directory")?;

    info!("sysprobe exiting with {}", code);
    std::process::exit(code);
}

/// Runs every selected case `iterations` times, in order
async fn run_iterations(config: &Config, scratch: &Path, reporter: &mut Reporter) {
    for iteration in 0..config.iterations {
        debug!("iteration {} of {}", iteration + 1, config.iterations);
        for &case in &config.cases {
            run_case(case, &config.options, scratch, reporter).await;
        }
    }
}
