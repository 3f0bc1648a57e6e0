//! Maintenance and recovery CLI for the mediaforge core.
//!
//! Stage processors are supplied by the embedding pipeline binary; this tool
//! hosts the store, workspace and recovery surfaces: project management,
//! plan inspection, integrity verification, interrupted-run recovery and
//! housekeeping.

mod cli;

use std::process::ExitCode;

use clap::Parser;

use cli::{exit_code_for, Cli};

#[tokio::main]
async fn main() -> ExitCode {
    let args = Cli::parse();
    init_tracing(&args);
    match cli::run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(error = %error, "command failed");
            eprintln!("error: {error}");
            ExitCode::from(exit_code_for(&error))
        }
    }
}

fn init_tracing(args: &Cli) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(args.log_level.clone()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
