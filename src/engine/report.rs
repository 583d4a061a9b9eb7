//! Batch-level documents in the output root: the summary and the error report.

use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use crate::pipeline::error_sink::ErrorReport;
use crate::types::{BatchReport, ProcessingResult};
use crate::utils::config::{FORMAT_VERSION, PackagePaths, TOOL_VERSION};
use crate::utils::tempfiles::{remove_stale_temp, rename_temp_to_final, temp_path_for};

#[derive(Serialize)]
struct ProcessingSpeed {
    packets_per_second: f64,
    mb_per_second: f64,
}

#[derive(Serialize)]
struct Totals {
    total_files_processed: usize,
    successful_files: usize,
    failed_files: usize,
    total_packets_decoded: usize,
    total_processing_time: f64,
    total_errors: usize,
    total_warnings: usize,
    total_file_size: u64,
    average_packets_per_file: f64,
    average_processing_time: f64,
    processing_speed: ProcessingSpeed,
}

#[derive(Serialize)]
struct ProtocolOverview {
    unique_protocols_found: Vec<String>,
    protocol_count: usize,
    /// Number of files each protocol occurs in.
    protocol_file_distribution: BTreeMap<String, usize>,
}

#[derive(Serialize)]
struct FileDetail {
    file: String,
    success: bool,
    packets: usize,
    size: u64,
    time: f64,
    warnings: usize,
    speed_pps: f64,
}

#[derive(Serialize)]
struct GenerationInfo {
    generated_at: String,
    generator: String,
    format_version: &'static str,
}

#[derive(Serialize)]
struct SummaryDocument {
    summary: Totals,
    protocol_overview: ProtocolOverview,
    file_details: Vec<FileDetail>,
    generation_info: GenerationInfo,
}

fn round_to(v: f64, places: i32) -> f64 {
    let f = 10f64.powi(places);
    (v * f).round() / f
}

fn build_summary(results: &[ProcessingResult], report: &BatchReport) -> SummaryDocument {
    let succeeded: Vec<&ProcessingResult> = results.iter().filter(|r| r.success).collect();
    let total_time: f64 = succeeded.iter().map(|r| r.processing_time_seconds).sum();
    let total_size: u64 = succeeded.iter().map(|r| r.file_size).sum();
    let total_packets: usize = succeeded.iter().map(|r| r.packet_count).sum();
    let n = succeeded.len();

    let mut all = BTreeSet::new();
    let mut per_file: BTreeMap<String, usize> = BTreeMap::new();
    for r in &succeeded {
        for p in &r.protocols {
            all.insert(p.clone());
            *per_file.entry(p.clone()).or_default() += 1;
        }
    }

    let per_sec = |amount: f64| if total_time > 0.0 { amount / total_time } else { 0.0 };
    SummaryDocument {
        summary: Totals {
            total_files_processed: report.total_files,
            successful_files: report.successful,
            failed_files: report.failed,
            total_packets_decoded: total_packets,
            total_processing_time: round_to(total_time, 3),
            total_errors: report.error_summary.total,
            total_warnings: report.error_summary.total_warnings,
            total_file_size: total_size,
            average_packets_per_file: if n > 0 {
                round_to(total_packets as f64 / n as f64, 1)
            } else {
                0.0
            },
            average_processing_time: if n > 0 {
                round_to(total_time / n as f64, 3)
            } else {
                0.0
            },
            processing_speed: ProcessingSpeed {
                packets_per_second: round_to(per_sec(total_packets as f64), 1),
                mb_per_second: round_to(per_sec(total_size as f64 / 1024.0 / 1024.0), 2),
            },
        },
        protocol_overview: ProtocolOverview {
            protocol_count: all.len(),
            unique_protocols_found: all.into_iter().collect(),
            protocol_file_distribution: per_file,
        },
        file_details: results
            .iter()
            .map(|r| FileDetail {
                file: r
                    .file_path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                success: r.success,
                packets: r.packet_count,
                size: r.file_size,
                time: round_to(r.processing_time_seconds, 3),
                warnings: r.warnings.len(),
                speed_pps: if r.processing_time_seconds > 0.0 {
                    round_to(r.packet_count as f64 / r.processing_time_seconds, 1)
                } else {
                    0.0
                },
            })
            .collect(),
        generation_info: GenerationInfo {
            generated_at: chrono::Utc::now().to_rfc3339(),
            generator: format!("{} v{}", PackagePaths::get().pkg_name(), TOOL_VERSION),
            format_version: FORMAT_VERSION,
        },
    }
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create report directory {}", parent.display()))?;
    }
    let temp = temp_path_for(path);
    remove_stale_temp(&temp)?;
    let body = serde_json::to_vec_pretty(value).context("serialize report")?;
    fs::write(&temp, body).with_context(|| format!("write report {}", temp.display()))?;
    rename_temp_to_final(&temp, path)
}

/// Write `batch_summary_report.json` under `output_root`.
pub fn write_summary_report(
    output_root: &Path,
    results: &[ProcessingResult],
    report: &BatchReport,
) -> Result<PathBuf> {
    let path = output_root.join(PackagePaths::get().summary_filename());
    write_json_atomic(&path, &build_summary(results, report))?;
    Ok(path)
}

/// Write `error_report.json` under `output_root`.
pub fn write_error_report(output_root: &Path, report: &ErrorReport) -> Result<PathBuf> {
    let path = output_root.join(PackagePaths::get().error_report_filename());
    write_json_atomic(&path, report)?;
    Ok(path)
}
