//! CLI command handler: build the config (defaults, then `.capsweep.toml`, then flags) and run.

use anyhow::{Context, Result};
use log::{info, warn};
use std::sync::atomic::Ordering;
use std::time::Duration;

use crate::engine::arg_parser::Cli;
use crate::engine::tools::{format_size, path_relative_to, running_as_root};
use crate::pipeline::BatchOrchestrator;
use crate::utils::capsweep_toml::{apply_file_to_config, load_capsweep_toml};
use crate::utils::{Colors, setup_logging};
use crate::{BatchConfig, BatchOutcome};

/// Defaults, then the settings file in INPUT, then command-line flags.
pub fn build_config(cli: &Cli) -> BatchConfig {
    let mut cfg = BatchConfig {
        input_root: cli.input.clone(),
        output_root: cli.output_dir(),
        ..BatchConfig::default()
    };
    if let Some(file) = load_capsweep_toml(&cli.input) {
        apply_file_to_config(&file, &mut cfg);
    }
    if let Some(out) = &cli.output {
        cfg.output_root = out.clone();
    }
    if let Some(jobs) = cli.jobs {
        cfg.max_workers = jobs;
    }
    if let Some(n) = cli.max_packets {
        cfg.max_packets = Some(n);
    }
    if let Some(secs) = cli.timeout {
        cfg.task_timeout = (secs > 0).then(|| Duration::from_secs(secs));
    }
    if let Some(depth) = cli.max_depth {
        cfg.max_depth = depth;
    }
    if let Some(policy) = cli.error_policy {
        cfg.error_policy = policy;
    }
    if let Some(mb) = cli.memory_limit {
        cfg.memory_limit_mb = Some(mb);
    }
    if let Some(v) = cli.verbose {
        cfg.verbose = v;
    }
    if let Some(v) = cli.error_report {
        cfg.error_report = v;
    }
    if let Some(n) = cli.streaming_threshold {
        cfg.streaming_threshold = n;
    }
    cfg.dry_run = cli.dry_run;
    cfg
}

/// Run a batch (or a dry-run scan) for the parsed command line.
pub fn handle_run(cli: &Cli) -> Result<BatchOutcome> {
    let cfg = build_config(cli);
    setup_logging(cfg.verbose);
    log::debug!("{} CONFIG:{:#?}", env!("CARGO_PKG_NAME").to_uppercase(), cfg);
    if running_as_root() {
        info!("Running as root; output documents will be owned by root.");
    }
    if cfg.dry_run {
        warn!("RUNNING IN DRY-RUN MODE. NOTHING WILL BE DECODED.");
    }

    let orchestrator =
        BatchOrchestrator::new(cfg.clone()).with_progress_bar(cfg.verbose && !cfg.dry_run);
    let cancel = orchestrator.cancel_handle();
    ctrlc::set_handler(move || {
        cancel.store(true, Ordering::Release);
    })
    .context("set Ctrl+C handler")?;

    let outcome = orchestrator
        .run()
        .with_context(|| format!("batch over {}", cfg.input_root.display()))?;

    if cfg.dry_run {
        print_scan_preview(&cfg, &outcome);
    } else {
        print_summary(&cfg, &outcome);
    }
    Ok(outcome)
}

/// Print discovered files with sizes.
fn print_scan_preview(cfg: &BatchConfig, outcome: &BatchOutcome) {
    let root = cfg.input_root.canonicalize().unwrap_or_else(|_| cfg.input_root.clone());
    let total: u64 = outcome.files.iter().map(|f| f.size_bytes).sum();
    for f in &outcome.files {
        let rel = path_relative_to(&f.path, &root).unwrap_or_else(|| f.path.clone());
        println!("{:>10}  {}", format_size(f.size_bytes), rel.display());
    }
    println!(
        "{} file(s), {} total; {} ignored, {} unreadable",
        outcome.scan.found_count,
        format_size(total),
        outcome.scan.ignored_count,
        outcome.scan.error_path_count
    );
}

fn print_summary(cfg: &BatchConfig, outcome: &BatchOutcome) {
    let r = &outcome.report;
    info!(
        "{} | {} | {} packets | {:.2}s ({:.1} packets/s)",
        Colors::colorize(Colors::SUCCESS, &format!("Succeeded: {}", r.successful)),
        Colors::colorize(Colors::FAILURE, &format!("Failed: {}", r.failed)),
        r.total_packets,
        r.total_time_seconds,
        r.packets_per_second
    );
    if let Some(reason) = &r.halted {
        warn!(
            "{}",
            Colors::colorize(Colors::SKIPPED, &format!("Dispatch halted early: {reason}"))
        );
    }
    if cfg.verbose {
        for res in outcome.results.iter().filter(|res| !res.success) {
            warn!(
                "  {}: {}",
                res.file_path.display(),
                res.error.as_deref().unwrap_or("unknown error")
            );
        }
    }
    info!("Output written to {}", cfg.output_root.display());
}
