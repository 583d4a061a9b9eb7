use clap::Parser;
use std::path::PathBuf;

use crate::types::ErrorPolicy;

/// Batch-decode packet captures into one JSON document per file.
#[derive(Clone, Parser)]
#[command(name = "capsweep")]
#[command(about = "Decode every capture file under a directory into JSON; use --dry-run to list only.")]
pub struct Cli {
    /// Directory containing capture files.
    #[arg(value_name = "INPUT")]
    pub input: PathBuf,

    /// Output directory. Default: `<INPUT>_json`.
    #[arg(long, short)]
    pub output: Option<PathBuf>,

    /// Number of files decoded in parallel (0 = one per available thread).
    #[arg(long, short = 'j')]
    pub jobs: Option<usize>,

    /// Stop reading each file after this many packets.
    #[arg(long)]
    pub max_packets: Option<usize>,

    /// Per-file timeout in seconds (0 = no timeout).
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Deepest directory level scanned (0 = files directly in INPUT).
    #[arg(long)]
    pub max_depth: Option<usize>,

    /// What to do when a file fails.
    #[arg(long, value_enum)]
    pub error_policy: Option<ErrorPolicy>,

    /// Hold new work while process memory is above this many MB.
    #[arg(long)]
    pub memory_limit: Option<f64>,

    /// Scan and list files; decode nothing.
    #[arg(long)]
    pub dry_run: bool,

    /// Verbose output and a progress bar.
    #[arg(long, short = 'v', num_args = 0..=1, default_missing_value = "true", value_parser = clap::value_parser!(bool))]
    pub verbose: Option<bool>,

    /// Write error_report.json when any errors were recorded.
    #[arg(long, num_args = 0..=1, default_missing_value = "true", value_parser = clap::value_parser!(bool))]
    pub error_report: Option<bool>,

    /// Packet count above which documents are streamed compact.
    #[arg(long)]
    pub streaming_threshold: Option<usize>,
}

impl Cli {
    /// Output directory, defaulting to a sibling `<INPUT>_json`.
    pub fn output_dir(&self) -> PathBuf {
        self.output.clone().unwrap_or_else(|| {
            let name = self
                .input
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .filter(|n| !n.is_empty() && n != "." && n != "..")
                .unwrap_or_else(|| "capsweep".to_string());
            self.input.with_file_name(format!("{name}_json"))
        })
    }
}
