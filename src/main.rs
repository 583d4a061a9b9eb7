//! Capsweep CLI: decode a directory of captures; use --dry-run to list files only.

use anyhow::Result;
use capsweep::engine::arg_parser::Cli;
use capsweep::engine::handle_run;
use clap::Parser;
use std::process::ExitCode;
use std::time::Instant;

fn main() -> Result<ExitCode> {
    let start_time = Instant::now();
    let cli = Cli::parse();
    let outcome = handle_run(&cli)?;
    log::debug!("Total time: {:?}", start_time.elapsed());
    if outcome.report.failed > 0 {
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}
