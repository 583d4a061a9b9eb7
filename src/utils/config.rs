//! Application configuration constants.
//! Defaults and thresholds in one place.

use std::sync::OnceLock;
use std::time::Duration;

// ---- Package / paths (from CARGO_PKG_NAME, cached) ----

/// Package-derived file names: built once from `CARGO_PKG_NAME`, then cached.
pub struct PackagePaths {
    pkg_name: &'static str,
    config_filename: String,
    summary_filename: String,
    error_report_filename: String,
}

static PACKAGE_PATHS: OnceLock<PackagePaths> = OnceLock::new();

impl PackagePaths {
    /// Build and cache names from `CARGO_PKG_NAME`. Called once on first use.
    pub fn get() -> &'static PackagePaths {
        PACKAGE_PATHS.get_or_init(|| {
            let pkg = env!("CARGO_PKG_NAME");
            PackagePaths {
                pkg_name: pkg,
                config_filename: format!(".{pkg}.toml"),
                summary_filename: "batch_summary_report.json".to_string(),
                error_report_filename: "error_report.json".to_string(),
            }
        })
    }

    pub fn pkg_name(&self) -> &str {
        self.pkg_name
    }

    /// Optional settings file looked up in the input root.
    pub fn config_filename(&self) -> &str {
        &self.config_filename
    }

    pub fn summary_filename(&self) -> &str {
        &self.summary_filename
    }

    pub fn error_report_filename(&self) -> &str {
        &self.error_report_filename
    }
}

// ---- Batch defaults ----

/// Defaults applied when neither the settings file nor the CLI set a value.
pub struct DefaultSettings;

impl DefaultSettings {
    pub const OUTPUT_DIR: &'static str = "capsweep_json";
    pub const MAX_WORKERS: usize = 1;
    pub const MAX_RECOMMENDED_WORKERS: usize = 32;
    /// Root files plus one level of sub-directories.
    pub const MAX_DEPTH: usize = 1;
    pub const TASK_TIMEOUT_SECS: u64 = 300;
    pub const MAX_DISK_USAGE_PERCENT: f64 = 95.0;
    pub const MIN_MEMORY_LIMIT_MB: f64 = 100.0;
    pub const STREAMING_THRESHOLD: usize = 1000;
    pub const EXTENSIONS: [&'static str; 3] = ["pcap", "pcapng", "cap"];

    pub fn extensions() -> Vec<String> {
        Self::EXTENSIONS.iter().map(|e| e.to_string()).collect()
    }
}

// ---- Admission control ----

/// Memory backoff and polling for the dispatch loop.
pub struct AdmissionConsts;

impl AdmissionConsts {
    pub const BACKOFF_INITIAL: Duration = Duration::from_millis(100);
    pub const BACKOFF_MAX: Duration = Duration::from_secs(2);
    pub const MAX_WAIT: Duration = Duration::from_secs(60);
    /// Longest the dispatch loop sleeps waiting for a result before re-checking timeouts.
    pub const POLL_INTERVAL: Duration = Duration::from_millis(250);
    /// Estimated output bytes per input byte (JSON is much larger than the capture).
    pub const OUTPUT_SIZE_FACTOR: f64 = 3.0;
}

// ---- Worker threads ----

/// Thread limits for worker pool sizing.
/// Use [`WorkerThreadLimits::current()`] to fill `all_threads` from rayon.
#[derive(Clone, Copy, Debug)]
pub struct WorkerThreadLimits {
    /// Available threads (from rayon); set by [`WorkerThreadLimits::current()`].
    pub all_threads: usize,
    /// Floor when nothing else is known.
    pub floor: usize,
}

impl Default for WorkerThreadLimits {
    fn default() -> Self {
        Self {
            all_threads: 0, // use current() to set from rayon
            floor: Self::FLOOR_THREADS,
        }
    }
}

impl WorkerThreadLimits {
    pub const FLOOR_THREADS: usize = 1;

    /// Build limits with `all_threads` set from `rayon::current_num_threads()`.
    pub fn current() -> Self {
        Self {
            all_threads: rayon::current_num_threads(),
            ..Self::default()
        }
    }

    /// Workers for a requested count. `0` means every available thread, but at least `floor`.
    pub fn resolve(&self, requested: usize) -> usize {
        match requested {
            0 => self.all_threads.max(self.floor),
            n => n,
        }
    }
}

// ---- Decoding ----

/// Capture reading thresholds.
pub struct CaptureConsts;

impl CaptureConsts {
    /// File size above which captures are memory-mapped instead of read (bytes). 64 MB.
    pub const MMAP_THRESHOLD: u64 = 64 * 1024 * 1024;
    /// Dissection stops after this many layers in one packet.
    pub const MAX_LAYERS: usize = 16;
    /// Block reader buffer (bytes). Larger than any record a sane snaplen allows.
    pub const READER_CAPACITY: usize = 4 * 1024 * 1024;
    /// Read buffers kept between files by the built-in decoder.
    pub const POOLED_BUFFERS: usize = 4;
    /// Buffers grown past this are dropped instead of pooled (bytes). 16 MB.
    pub const POOLED_BUFFER_MAX_BYTES: usize = 16 * 1024 * 1024;
}

// ---- Output ----

pub const FORMAT_VERSION: &str = "1.1.0";
pub const TOOL_VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_request_respects_floor() {
        let limits = WorkerThreadLimits {
            all_threads: 0,
            floor: 1,
        };
        assert_eq!(limits.resolve(0), 1);
        assert_eq!(limits.resolve(3), 3);

        let limits = WorkerThreadLimits {
            all_threads: 8,
            floor: 2,
        };
        assert_eq!(limits.resolve(0), 8);
        assert_eq!(limits.resolve(1), 1);
    }
}
