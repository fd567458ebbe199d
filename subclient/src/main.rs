//! Binary entry point: parse the CLI, run, map errors to exit codes.
//!
//! Exit codes: 0 normal, 1 unexpected failure, 2 configuration/validation,
//! 3 fatal output I/O.

use clap::Parser;
use polaris_subclient::cli::Cli;
use polaris_subclient::run;
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run::execute(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            // Logging may not be initialised yet (config errors), so the
            // error goes to stderr directly as well.
            tracing::error!(error = %e, "exiting");
            eprintln!("error: {e}");
            ExitCode::from(e.exit_code())
        }
    }
}
