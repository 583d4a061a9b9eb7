//! Append-only, thread-safe store of error records with derived summaries.
//!
//! Packet-level warnings from files that still decoded are kept in a separate list; they never
//! count toward `total`, `files_affected` or `error_rate`.

use log::{debug, error, warn};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::engine::tools::unix_now;
use crate::error::ErrorKind;
use crate::types::{ErrorRecord, ErrorSummary};

/// Summary plus the full record list; the body of `error_report.json`.
#[derive(Clone, Debug, Serialize)]
pub struct ErrorReport {
    pub generated_at: String,
    pub summary: ErrorSummary,
    pub errors: Vec<ErrorRecord>,
    pub warnings: Vec<ErrorRecord>,
}

#[derive(Default)]
pub struct ErrorSink {
    records: Mutex<Vec<ErrorRecord>>,
    warnings: Mutex<Vec<ErrorRecord>>,
    /// Units processed so far; denominator of `error_rate`.
    total_units: AtomicUsize,
    verbose: bool,
}

impl ErrorSink {
    pub fn new(verbose: bool) -> Self {
        Self {
            verbose,
            ..Self::default()
        }
    }

    fn records(&self) -> MutexGuard<'_, Vec<ErrorRecord>> {
        lock(&self.records)
    }

    fn warnings(&self) -> MutexGuard<'_, Vec<ErrorRecord>> {
        lock(&self.warnings)
    }

    /// Record an error. Never fails; if the record cannot be stored it is logged instead.
    pub fn add_error(
        &self,
        kind: ErrorKind,
        message: impl Into<String>,
        path: Option<&Path>,
        details: Option<BTreeMap<String, String>>,
    ) {
        let record = ErrorRecord {
            kind,
            message: message.into(),
            file_path: path.map(Path::to_path_buf),
            details: details.unwrap_or_default(),
            timestamp: unix_now(),
        };
        let location = record
            .file_path
            .as_deref()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        if self.verbose {
            warn!("{} {}: {}", kind, location, record.message);
        } else {
            debug!("{} {}: {}", kind, location, record.message);
        }
        let mut records = self.records();
        if records.try_reserve(1).is_err() {
            error!("Dropped error record {} {}: {}", kind, location, record.message);
            return;
        }
        records.push(record);
    }

    /// Record a packet-level warning for a file that otherwise decoded.
    pub fn add_warning(
        &self,
        message: impl Into<String>,
        path: Option<&Path>,
        details: Option<BTreeMap<String, String>>,
    ) {
        let record = ErrorRecord {
            kind: ErrorKind::PacketDecode,
            message: message.into(),
            file_path: path.map(Path::to_path_buf),
            details: details.unwrap_or_default(),
            timestamp: unix_now(),
        };
        debug!("warning {:?}: {}", record.file_path, record.message);
        let mut warnings = self.warnings();
        if warnings.try_reserve(1).is_err() {
            error!("Dropped warning {:?}: {}", record.file_path, record.message);
            return;
        }
        warnings.push(record);
    }

    /// Set how many units the batch covers.
    pub fn set_total(&self, units: usize) {
        self.total_units.store(units, Ordering::Release);
    }

    /// All records in insertion order.
    pub fn get_errors(&self) -> Vec<ErrorRecord> {
        self.records().clone()
    }

    pub fn get_warnings(&self) -> Vec<ErrorRecord> {
        self.warnings().clone()
    }

    pub fn warning_count(&self) -> usize {
        self.warnings().len()
    }

    pub fn len(&self) -> usize {
        self.records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records().is_empty()
    }

    pub fn get_summary(&self) -> ErrorSummary {
        let records = self.records();
        let mut by_kind: BTreeMap<String, usize> = BTreeMap::new();
        let mut files: BTreeSet<PathBuf> = BTreeSet::new();
        for r in records.iter() {
            *by_kind.entry(r.kind.as_str().to_string()).or_default() += 1;
            if let Some(p) = &r.file_path {
                files.insert(p.clone());
            }
        }
        let units = self.total_units.load(Ordering::Acquire);
        ErrorSummary {
            total: records.len(),
            total_warnings: self.warning_count(),
            by_kind,
            error_rate: if units > 0 {
                (files.len() as f64 / units as f64).min(1.0)
            } else {
                0.0
            },
            files_affected: files.into_iter().collect(),
        }
    }

    pub fn generate_report(&self) -> ErrorReport {
        ErrorReport {
            generated_at: chrono::Utc::now().to_rfc3339(),
            summary: self.get_summary(),
            errors: self.get_errors(),
            warnings: self.get_warnings(),
        }
    }
}

fn lock(m: &Mutex<Vec<ErrorRecord>>) -> MutexGuard<'_, Vec<ErrorRecord>> {
    m.lock().unwrap_or_else(|poisoned| {
        error!("Error sink lock was poisoned; recovering");
        poisoned.into_inner()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn summary_counts_by_kind_and_file() {
        let sink = ErrorSink::new(false);
        sink.set_total(10);
        sink.add_error(
            ErrorKind::InvalidFileFormat,
            "bad magic",
            Some(Path::new("/in/broken.pcap")),
            None,
        );
        sink.add_error(
            ErrorKind::PacketDecode,
            "short",
            Some(Path::new("/in/broken.pcap")),
            Some(BTreeMap::from([("packet".into(), "7".into())])),
        );
        sink.add_error(ErrorKind::Timeout, "slow", Some(Path::new("/in/slow.pcap")), None);

        let summary = sink.get_summary();
        assert_eq!(summary.total, 3);
        assert_eq!(summary.by_kind["InvalidFileFormatError"], 1);
        assert_eq!(summary.by_kind["TimeoutError"], 1);
        assert_eq!(summary.files_affected.len(), 2);
        assert!((summary.error_rate - 0.2).abs() < 1e-9);
        assert_eq!(sink.get_errors()[1].details["packet"], "7");
    }

    #[test]
    fn warnings_do_not_count_as_errors() {
        let sink = ErrorSink::new(false);
        sink.set_total(1);
        for i in 0..5 {
            sink.add_warning(format!("packet #{i}: truncated"), Some(Path::new("short.pcap")), None);
        }
        let summary = sink.get_summary();
        assert_eq!(summary.total, 0);
        assert_eq!(summary.total_warnings, 5);
        assert_eq!(summary.error_rate, 0.0);
        assert!(summary.files_affected.is_empty());
        assert!(sink.is_empty());
        assert_eq!(sink.get_warnings()[4].kind, ErrorKind::PacketDecode);
    }

    #[test]
    fn rate_is_bounded_by_failed_files() {
        let sink = ErrorSink::new(false);
        sink.set_total(2);
        for _ in 0..4 {
            sink.add_error(ErrorKind::Decode, "x", Some(Path::new("a.pcap")), None);
        }
        assert_eq!(sink.get_summary().total, 4);
        assert_eq!(sink.get_summary().error_rate, 0.5);
    }

    #[test]
    fn no_units_means_zero_rate() {
        let sink = ErrorSink::new(false);
        sink.add_error(ErrorKind::Decode, "x", None, None);
        assert_eq!(sink.get_summary().error_rate, 0.0);
    }

    #[test]
    fn concurrent_adds_are_all_kept() {
        let sink = Arc::new(ErrorSink::new(false));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let sink = Arc::clone(&sink);
                thread::spawn(move || {
                    for i in 0..50 {
                        sink.add_error(ErrorKind::Decode, format!("{t}-{i}"), None, None);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(sink.len(), 400);
    }

    #[test]
    fn report_serializes() {
        let sink = ErrorSink::new(true);
        sink.add_error(ErrorKind::Output, "disk", Some(Path::new("a.pcap")), None);
        let json = serde_json::to_value(sink.generate_report()).unwrap();
        assert_eq!(json["summary"]["total"], 1);
        assert_eq!(json["errors"][0]["kind"], "OutputError");
    }
}
