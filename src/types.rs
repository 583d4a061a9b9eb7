//! Public and internal types for the capsweep API and pipeline.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{BatchError, ErrorKind};
use crate::utils::config::{AdmissionConsts, DefaultSettings};

/// A candidate capture file found by the scan. Depth 0 = direct child of the root.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DiscoveredFile {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub depth: usize,
}

/// Counters for one scan. Recomputed each scan, never merged.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ScanStatistics {
    pub found_count: usize,
    pub ignored_count: usize,
    pub error_path_count: usize,
    pub total_processed: usize,
    pub elapsed_seconds: f64,
}

/// Outcome for exactly one discovered file.
#[derive(Clone, Debug, Serialize)]
pub struct ProcessingResult {
    pub file_path: PathBuf,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_path: Option<PathBuf>,
    pub packet_count: usize,
    pub processing_time_seconds: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    pub warnings: Vec<String>,
    /// Size of the input capture in bytes.
    pub file_size: u64,
    /// Unique protocol names seen in the file (sorted). Empty on failure.
    pub protocols: Vec<String>,
}

impl ProcessingResult {
    pub fn succeeded(
        file_path: PathBuf,
        output_path: PathBuf,
        packet_count: usize,
        elapsed: Duration,
    ) -> Self {
        Self {
            file_path,
            success: true,
            output_path: Some(output_path),
            packet_count,
            processing_time_seconds: elapsed.as_secs_f64(),
            error: None,
            error_kind: None,
            warnings: Vec::new(),
            file_size: 0,
            protocols: Vec::new(),
        }
    }

    pub fn failed(
        file_path: PathBuf,
        kind: ErrorKind,
        message: impl Into<String>,
        elapsed: Duration,
    ) -> Self {
        Self {
            file_path,
            success: false,
            output_path: None,
            packet_count: 0,
            processing_time_seconds: elapsed.as_secs_f64(),
            error: Some(message.into()),
            error_kind: Some(kind),
            warnings: Vec::new(),
            file_size: 0,
            protocols: Vec::new(),
        }
    }

    pub fn with_file_size(mut self, size: u64) -> Self {
        self.file_size = size;
        self
    }
}

/// One entry in the [`ErrorSink`](crate::pipeline::ErrorSink). Never mutated after insertion.
#[derive(Clone, Debug, Serialize)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, String>,
    /// Seconds since the Unix epoch.
    pub timestamp: f64,
}

/// Derived view over the error sink.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ErrorSummary {
    pub total: usize,
    /// Packet warnings from files that decoded; not part of `total`.
    pub total_warnings: usize,
    pub by_kind: BTreeMap<String, usize>,
    /// Share of units with at least one error record; 0 when nothing was processed.
    pub error_rate: f64,
    pub files_affected: Vec<PathBuf>,
}

/// Point-in-time resource reading. `memory_limit_mb` is `None` when unlimited.
#[derive(Clone, Debug, Serialize)]
pub struct ResourceSnapshot {
    pub memory_used_mb: f64,
    pub memory_limit_mb: Option<f64>,
    /// `None` when the output location's disk could not be resolved.
    pub disk_free_percent: Option<f64>,
    pub disk_limit_percent: f64,
    pub sampled_at: f64,
}

/// Final per-batch report; built once from the results and the error summary.
#[derive(Clone, Debug, Default, Serialize)]
pub struct BatchReport {
    pub total_files: usize,
    pub successful: usize,
    pub failed: usize,
    pub total_packets: usize,
    pub total_time_seconds: f64,
    pub error_summary: ErrorSummary,
    pub degraded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub halted: Option<String>,
    pub success_rate: f64,
    pub packets_per_second: f64,
    pub peak_memory_mb: f64,
}

/// What to do when a file fails.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ErrorPolicy {
    /// Keep dispatching.
    #[default]
    Continue,
    /// Stop admitting new files; in-flight files finish.
    Stop,
    /// Keep dispatching but mark the batch degraded.
    Collect,
}

/// Orchestrator lifecycle. `Completed` is reached exactly once per run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum BatchState {
    Idle,
    Scanning,
    Dispatching,
    Draining,
    Completed,
}

/// Everything a run hands back to its caller.
#[derive(Debug)]
pub struct BatchOutcome {
    pub state: BatchState,
    pub scan: ScanStatistics,
    pub files: Vec<DiscoveredFile>,
    /// One per discovered file, in discovery order. Empty on dry runs.
    pub results: Vec<ProcessingResult>,
    pub report: BatchReport,
}

/// Full batch configuration. Built by the CLI (or the lib caller) and passed into the orchestrator.
#[derive(Clone, Debug)]
pub struct BatchConfig {
    pub input_root: PathBuf,
    pub output_root: PathBuf,
    /// Worker pool size. 0 = derive from available threads.
    pub max_workers: usize,
    /// Stop reading a file after this many packets.
    pub max_packets: Option<usize>,
    /// Deepest level scanned (0 = files directly under the root).
    pub max_depth: usize,
    /// Lowercase extensions without the dot.
    pub extensions: Vec<String>,
    pub error_policy: ErrorPolicy,
    /// Scan only; do not dispatch.
    pub dry_run: bool,
    pub verbose: bool,
    pub follow_links: bool,
    /// Per-file ceiling. `None` = no ceiling.
    pub task_timeout: Option<Duration>,
    /// Process RSS ceiling for admitting new work. `None` = unlimited.
    pub memory_limit_mb: Option<f64>,
    /// Highest acceptable used-space percentage on the output disk.
    pub max_disk_usage_percent: f64,
    /// Files above this are excluded before dispatch. `None` = no limit.
    pub max_file_size_mb: Option<f64>,
    pub admission_backoff: Duration,
    pub admission_backoff_max: Duration,
    /// Give up on a file whose admission has waited this long for memory.
    pub admission_max_wait: Duration,
    /// Packet count above which output documents are streamed.
    pub streaming_threshold: usize,
    /// Write `error_report.json` when errors or packet warnings were recorded.
    pub error_report: bool,
    /// Write `batch_summary_report.json` when at least one file succeeded.
    pub summary_report: bool,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            input_root: PathBuf::from("."),
            output_root: PathBuf::from(DefaultSettings::OUTPUT_DIR),
            max_workers: DefaultSettings::MAX_WORKERS,
            max_packets: None,
            max_depth: DefaultSettings::MAX_DEPTH,
            extensions: DefaultSettings::extensions(),
            error_policy: ErrorPolicy::Continue,
            dry_run: false,
            verbose: false,
            follow_links: false,
            task_timeout: Some(Duration::from_secs(DefaultSettings::TASK_TIMEOUT_SECS)),
            memory_limit_mb: None,
            max_disk_usage_percent: DefaultSettings::MAX_DISK_USAGE_PERCENT,
            max_file_size_mb: None,
            admission_backoff: AdmissionConsts::BACKOFF_INITIAL,
            admission_backoff_max: AdmissionConsts::BACKOFF_MAX,
            admission_max_wait: AdmissionConsts::MAX_WAIT,
            streaming_threshold: DefaultSettings::STREAMING_THRESHOLD,
            error_report: false,
            summary_report: true,
        }
    }
}

impl BatchConfig {
    /// Reject settings the orchestrator cannot honor. Returns every problem at once.
    pub fn validate(&self) -> Result<(), BatchError> {
        let mut problems = Vec::new();
        if self.max_packets == Some(0) {
            problems.push("max_packets must be at least 1".to_string());
        }
        if self.task_timeout == Some(Duration::ZERO) {
            problems.push("task timeout must be greater than zero".to_string());
        }
        if let Some(limit) = self.memory_limit_mb
            && limit < DefaultSettings::MIN_MEMORY_LIMIT_MB
        {
            problems.push(format!(
                "memory limit must be at least {} MB",
                DefaultSettings::MIN_MEMORY_LIMIT_MB
            ));
        }
        if !(self.max_disk_usage_percent > 0.0 && self.max_disk_usage_percent <= 100.0) {
            problems.push("max disk usage percent must be in (0, 100]".to_string());
        }
        if self.extensions.is_empty() {
            problems.push("at least one file extension is required".to_string());
        }
        if self.max_workers > DefaultSettings::MAX_RECOMMENDED_WORKERS {
            log::warn!(
                "{} workers requested; more than {} is rarely useful",
                self.max_workers,
                DefaultSettings::MAX_RECOMMENDED_WORKERS
            );
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(BatchError::InvalidConfig(problems))
        }
    }
}
