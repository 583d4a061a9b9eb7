//! Batch scheduler: scan, admit files onto a bounded set of decode workers, collect results, report.
//!
//! Lifecycle is `Idle -> Scanning -> Dispatching -> Draining -> Completed`. The orchestrator is
//! consumed by [`BatchOrchestrator::run`], so a batch cannot be run twice.

use crossbeam_channel::{Receiver, Sender, unbounded};
use log::{debug, info, warn};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::decode::{CaptureDecoder, PacketDecoder};
use crate::engine::output::OutputWriter;
use crate::engine::progress::ProgressSink;
use crate::engine::report::{write_error_report, write_summary_report};
use crate::engine::task::{FileDecodeTask, TaskGate, panic_message};
use crate::engine::tools::{canonical_root, output_path_for};
use crate::error::{BatchError, ErrorKind};
use crate::pipeline::context::{DispatchContext, InFlight, TaskMessage};
use crate::pipeline::error_sink::ErrorSink;
use crate::pipeline::walk::PathDiscoverer;
use crate::pipeline::worker::spawn_decode_worker;
use crate::resources::ResourceGovernor;
use crate::types::{
    BatchConfig, BatchOutcome, BatchReport, BatchState, DiscoveredFile, ErrorPolicy,
    ProcessingResult, ScanStatistics,
};
use crate::utils::config::{AdmissionConsts, WorkerThreadLimits};
use crate::utils::fd_limit::determine_workers_given_fd_limit;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Result of waiting for memory headroom before admitting a file.
enum Admission {
    Granted,
    /// Waited the configured maximum; the file is excluded.
    GaveUp(Duration),
    Cancelled,
}

pub struct BatchOrchestrator {
    cfg: BatchConfig,
    decoder: Arc<dyn PacketDecoder>,
    governor: Arc<ResourceGovernor>,
    errors: Arc<ErrorSink>,
    cancel: Arc<AtomicBool>,
    show_progress: bool,
    state: BatchState,
}

/// Mutable state of one dispatch phase.
struct Dispatch {
    files: Vec<DiscoveredFile>,
    input_root: PathBuf,
    results: Vec<Option<ProcessingResult>>,
    in_flight: HashMap<usize, InFlight>,
    progress: Arc<ProgressSink>,
    result_tx: Sender<TaskMessage>,
    result_rx: Receiver<TaskMessage>,
    halted: Option<String>,
    degraded: bool,
    disk_failure: Option<BatchError>,
}

impl BatchOrchestrator {
    /// Orchestrator with the built-in capture decoder and live resource readings.
    pub fn new(cfg: BatchConfig) -> Self {
        let governor = ResourceGovernor::new(&cfg);
        let errors = ErrorSink::new(cfg.verbose);
        Self {
            decoder: Arc::new(CaptureDecoder::default()),
            governor: Arc::new(governor),
            errors: Arc::new(errors),
            cancel: Arc::new(AtomicBool::new(false)),
            show_progress: false,
            state: BatchState::Idle,
            cfg,
        }
    }

    /// Replace the decode collaborator.
    pub fn with_decoder(mut self, decoder: Arc<dyn PacketDecoder>) -> Self {
        self.decoder = decoder;
        self
    }

    /// Replace the resource governor (e.g. one built over a scripted probe).
    pub fn with_governor(mut self, governor: ResourceGovernor) -> Self {
        self.governor = Arc::new(governor);
        self
    }

    /// Draw a terminal progress bar while dispatching.
    pub fn with_progress_bar(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    /// Setting this flag stops new admissions; in-flight files finish or time out.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn error_sink(&self) -> Arc<ErrorSink> {
        Arc::clone(&self.errors)
    }

    pub fn state(&self) -> BatchState {
        self.state
    }

    fn transition(&mut self, next: BatchState) {
        debug!("Batch state {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    fn worker_count(&self) -> usize {
        let requested = WorkerThreadLimits::current().resolve(self.cfg.max_workers);
        determine_workers_given_fd_limit(requested)
    }

    /// Run the whole batch.
    ///
    /// Returns `Err` only for batch-scoped failures: invalid configuration, a missing root, or
    /// disk exhaustion under the `stop` policy. Per-file failures are in the outcome.
    pub fn run(mut self) -> Result<BatchOutcome, BatchError> {
        self.cfg.validate()?;
        let start = Instant::now();

        self.transition(BatchState::Scanning);
        let (files, scan) = PathDiscoverer::from_config(&self.cfg)
            .scan(&self.cfg.input_root, self.cfg.max_depth)?;
        info!(
            "Found {} capture file(s) under {} ({} ignored, {} unreadable)",
            scan.found_count,
            self.cfg.input_root.display(),
            scan.ignored_count,
            scan.error_path_count
        );

        if self.cfg.dry_run {
            self.transition(BatchState::Completed);
            return Ok(BatchOutcome {
                state: self.state,
                scan,
                files,
                results: Vec::new(),
                report: BatchReport::default(),
            });
        }
        if files.is_empty() {
            self.governor.cleanup();
            self.transition(BatchState::Completed);
            return Ok(BatchOutcome {
                state: self.state,
                scan,
                files,
                results: Vec::new(),
                report: BatchReport::default(),
            });
        }

        let input_root = canonical_root(&self.cfg.input_root)?;
        let decoder = Arc::clone(&self.decoder);
        self.governor
            .register_cleanup(move || decoder.release_buffers());
        self.errors.set_total(files.len());

        let progress = Arc::new(if self.show_progress {
            ProgressSink::with_bar(files.len())
        } else {
            ProgressSink::new(files.len())
        });
        let (result_tx, result_rx) = unbounded();
        let mut dispatch = Dispatch {
            results: vec![None; files.len()],
            files,
            input_root,
            in_flight: HashMap::new(),
            progress,
            result_tx,
            result_rx,
            halted: None,
            degraded: false,
            disk_failure: None,
        };

        self.transition(BatchState::Dispatching);
        self.dispatch_all(&mut dispatch);

        self.transition(BatchState::Draining);
        self.drain(&mut dispatch);

        self.finish(dispatch, scan, start)
    }

    fn dispatch_all(&self, d: &mut Dispatch) {
        let workers = self.worker_count();
        info!("Decoding with up to {} worker(s)", workers);
        let ctx = Arc::new(DispatchContext {
            task: FileDecodeTask::new(
                Arc::clone(&self.decoder),
                OutputWriter::new(self.cfg.streaming_threshold),
            ),
            max_packets: self.cfg.max_packets,
        });

        let mut next = 0;
        while next < d.files.len() {
            if self.cancel.load(Ordering::Acquire) && d.halted.is_none() {
                d.halted = Some("cancelled".to_string());
            }
            if d.halted.is_some() {
                break;
            }
            self.collect(d, Duration::ZERO);
            if d.in_flight.len() >= workers {
                self.collect(d, AdmissionConsts::POLL_INTERVAL);
                continue;
            }

            let size_mb = d.files[next].size_bytes as f64 / BYTES_PER_MB;
            if let Some(max_mb) = self.cfg.max_file_size_mb
                && size_mb > max_mb
            {
                let msg = format!("file is {size_mb:.1} MB, limit is {max_mb:.1} MB");
                self.exclude(d, next, ErrorKind::Memory, msg);
                next += 1;
                continue;
            }

            match self.await_memory(d) {
                Admission::Granted => {}
                Admission::Cancelled => continue,
                Admission::GaveUp(waited) => {
                    let msg = format!(
                        "memory stayed above the limit for {:.1}s; file not admitted",
                        waited.as_secs_f64()
                    );
                    self.exclude(d, next, ErrorKind::Memory, msg);
                    next += 1;
                    continue;
                }
            }

            let required_mb = size_mb * AdmissionConsts::OUTPUT_SIZE_FACTOR;
            if !self.governor.check_disk_space(required_mb) {
                self.halt_on_disk(d, next, required_mb);
                next += 1;
                break;
            }

            self.admit(d, &ctx, next);
            next += 1;
        }

        for index in next..d.files.len() {
            let path = d.files[index].path.clone();
            let reason = d.halted.as_deref().unwrap_or("not dispatched");
            let result = ProcessingResult::failed(
                path,
                ErrorKind::Cancelled,
                format!("not dispatched: {reason}"),
                Duration::ZERO,
            )
            .with_file_size(d.files[index].size_bytes);
            d.progress.skip_one(None);
            d.results[index] = Some(result);
        }
    }

    /// Hold admission until memory is under the ceiling. Results keep being collected meanwhile.
    fn await_memory(&self, d: &mut Dispatch) -> Admission {
        let started = Instant::now();
        let mut backoff = self.cfg.admission_backoff;
        loop {
            if self.governor.check_memory() {
                return Admission::Granted;
            }
            if self.cancel.load(Ordering::Acquire) {
                d.halted.get_or_insert_with(|| "cancelled".to_string());
                return Admission::Cancelled;
            }
            let waited = started.elapsed();
            if waited >= self.cfg.admission_max_wait {
                return Admission::GaveUp(waited);
            }
            debug!(
                "Memory over limit; holding admission for {:?} ({} in flight)",
                backoff,
                d.in_flight.len()
            );
            self.collect(d, backoff);
            if d.halted.is_some() {
                return Admission::Cancelled;
            }
            backoff = (backoff * 2).min(self.cfg.admission_backoff_max);
        }
    }

    fn admit(&self, d: &mut Dispatch, ctx: &Arc<DispatchContext>, index: usize) {
        let file = &d.files[index];
        let output_path = output_path_for(&file.path, &d.input_root, &self.cfg.output_root);
        let gate = Arc::new(TaskGate::new());
        let spawned = spawn_decode_worker(
            Arc::clone(ctx),
            index,
            file.path.clone(),
            output_path,
            Arc::clone(&gate),
            d.result_tx.clone(),
        );
        match spawned {
            Ok(handle) => {
                debug!("Admitted #{} {}", index, file.path.display());
                d.progress.started();
                d.in_flight.insert(
                    index,
                    InFlight {
                        path: file.path.clone(),
                        started: Instant::now(),
                        gate,
                        handle,
                    },
                );
            }
            Err(e) => {
                let msg = format!("cannot start worker: {e}");
                self.exclude(d, index, ErrorKind::Memory, msg);
            }
        }
    }

    /// Fail a file that was never admitted.
    fn exclude(&self, d: &mut Dispatch, index: usize, kind: ErrorKind, message: String) {
        let file = &d.files[index];
        warn!("Excluding {}: {}", file.path.display(), message);
        let details = BTreeMap::from([("size_bytes".to_string(), file.size_bytes.to_string())]);
        self.errors
            .add_error(kind, message.clone(), Some(&file.path), Some(details));
        let result = ProcessingResult::failed(file.path.clone(), kind, message, Duration::ZERO)
            .with_file_size(file.size_bytes);
        d.progress.skip_one(file_label(&file.path).as_deref());
        d.results[index] = Some(result);
        self.apply_policy(d);
    }

    fn halt_on_disk(&self, d: &mut Dispatch, index: usize, required_mb: f64) {
        let reason = format!(
            "output disk would exceed {:.1}% usage (needs ~{:.1} MB)",
            self.cfg.max_disk_usage_percent, required_mb
        );
        self.exclude(d, index, ErrorKind::DiskSpace, reason.clone());
        d.halted = Some(format!("disk space: {reason}"));
        d.degraded = true;
        if self.cfg.error_policy == ErrorPolicy::Stop {
            d.disk_failure = Some(BatchError::DiskSpace {
                path: self.cfg.output_root.clone(),
                reason,
            });
        }
    }

    fn apply_policy(&self, d: &mut Dispatch) {
        match self.cfg.error_policy {
            ErrorPolicy::Continue => {}
            ErrorPolicy::Stop => {
                d.halted
                    .get_or_insert_with(|| "a file failed under the stop policy".to_string());
            }
            ErrorPolicy::Collect => d.degraded = true,
        }
    }

    /// Take finished results for up to `wait`, then expire timed-out tasks.
    fn collect(&self, d: &mut Dispatch, wait: Duration) {
        let first = if wait.is_zero() {
            d.result_rx.try_recv().ok()
        } else {
            d.result_rx.recv_timeout(wait).ok()
        };
        if let Some(msg) = first {
            self.on_result(d, msg);
            while let Ok(msg) = d.result_rx.try_recv() {
                self.on_result(d, msg);
            }
        }
        self.expire_timeouts(d);
    }

    fn on_result(&self, d: &mut Dispatch, msg: TaskMessage) {
        let TaskMessage { index, result } = msg;
        let Some(flight) = d.in_flight.remove(&index) else {
            debug!(
                "Discarding late result for {} (already timed out)",
                result.file_path.display()
            );
            return;
        };
        join_worker(flight.handle, &flight.path);
        let result = result.with_file_size(d.files[index].size_bytes);
        let label = file_label(&flight.path);

        for (i, w) in result.warnings.iter().enumerate() {
            let details = BTreeMap::from([("warning_index".to_string(), i.to_string())]);
            self.errors
                .add_warning(w.clone(), Some(&result.file_path), Some(details));
        }
        if result.success {
            d.progress.finish_one(true, label.as_deref());
        } else {
            let kind = result.error_kind.unwrap_or(ErrorKind::Decode);
            let details = BTreeMap::from([(
                "processing_time_seconds".to_string(),
                format!("{:.3}", result.processing_time_seconds),
            )]);
            self.errors.add_error(
                kind,
                result.error.clone().unwrap_or_default(),
                Some(&result.file_path),
                Some(details),
            );
            d.progress.finish_one(false, label.as_deref());
            if kind == ErrorKind::DiskSpace {
                d.halted
                    .get_or_insert_with(|| "disk space: output write failed".to_string());
                d.degraded = true;
            }
            self.apply_policy(d);
        }
        d.results[index] = Some(result);
    }

    /// Give up on tasks past the timeout. A task whose worker already started publishing its
    /// document stays in flight; its result arrives through the channel.
    fn expire_timeouts(&self, d: &mut Dispatch) {
        let Some(limit) = self.cfg.task_timeout else {
            return;
        };
        let expired: Vec<usize> = d
            .in_flight
            .iter()
            .filter(|(_, f)| f.started.elapsed() > limit && f.gate.try_abandon())
            .map(|(i, _)| *i)
            .collect();
        for index in expired {
            let Some(flight) = d.in_flight.remove(&index) else {
                continue;
            };
            let elapsed = flight.started.elapsed();
            let msg = format!("exceeded timeout of {:.1}s", limit.as_secs_f64());
            warn!("{}: {}; abandoning", flight.path.display(), msg);
            let details = BTreeMap::from([(
                "timeout_seconds".to_string(),
                limit.as_secs_f64().to_string(),
            )]);
            self.errors
                .add_error(ErrorKind::Timeout, msg.clone(), Some(&flight.path), Some(details));
            d.progress
                .finish_one(false, file_label(&flight.path).as_deref());
            d.results[index] = Some(
                ProcessingResult::failed(flight.path, ErrorKind::Timeout, msg, elapsed)
                    .with_file_size(d.files[index].size_bytes),
            );
            self.apply_policy(d);
        }
    }

    fn drain(&self, d: &mut Dispatch) {
        while !d.in_flight.is_empty() {
            self.collect(d, AdmissionConsts::POLL_INTERVAL);
        }
    }

    fn finish(
        mut self,
        d: Dispatch,
        scan: ScanStatistics,
        start: Instant,
    ) -> Result<BatchOutcome, BatchError> {
        let results: Vec<ProcessingResult> = d
            .results
            .into_iter()
            .zip(&d.files)
            .map(|(r, f)| {
                r.unwrap_or_else(|| {
                    ProcessingResult::failed(
                        f.path.clone(),
                        ErrorKind::Cancelled,
                        "no result recorded",
                        Duration::ZERO,
                    )
                })
            })
            .collect();

        let report = build_report(
            &results,
            &self.errors,
            start.elapsed(),
            d.degraded,
            d.halted,
            self.governor.peak_memory_mb(),
        );
        self.write_batch_reports(&results, &report);

        self.governor.cleanup();
        d.progress.close();
        self.transition(BatchState::Completed);
        info!(
            "Batch complete: {} ok, {} failed, {} packets in {:.2}s",
            report.successful, report.failed, report.total_packets, report.total_time_seconds
        );

        if let Some(err) = d.disk_failure {
            return Err(err);
        }
        Ok(BatchOutcome {
            state: self.state,
            scan,
            files: d.files,
            results,
            report,
        })
    }

    fn write_batch_reports(&self, results: &[ProcessingResult], report: &BatchReport) {
        let out = &self.cfg.output_root;
        if self.cfg.summary_report && report.successful > 0 {
            match write_summary_report(out, results, report) {
                Ok(p) => debug!("Summary report: {}", p.display()),
                Err(e) => warn!("Could not write summary report: {:#}", e),
            }
        }
        let has_records = !self.errors.is_empty() || self.errors.warning_count() > 0;
        if self.cfg.error_report && has_records {
            match write_error_report(out, &self.errors.generate_report()) {
                Ok(p) => info!("Error report: {}", p.display()),
                Err(e) => warn!("Could not write error report: {:#}", e),
            }
        }
    }
}

/// Reap a worker that has reported. A panic that escaped the task (after its result was sent)
/// is logged; the result already received stands.
fn join_worker(handle: JoinHandle<()>, path: &Path) -> bool {
    match handle.join() {
        Ok(()) => true,
        Err(payload) => {
            warn!(
                "Worker for {} panicked after reporting: {}",
                path.display(),
                panic_message(payload.as_ref())
            );
            false
        }
    }
}

fn file_label(path: &Path) -> Option<String> {
    path.file_name().map(|n| n.to_string_lossy().into_owned())
}

/// Derive the final report from results and the error sink.
pub fn build_report(
    results: &[ProcessingResult],
    errors: &ErrorSink,
    elapsed: Duration,
    degraded: bool,
    halted: Option<String>,
    peak_memory_mb: f64,
) -> BatchReport {
    let total_files = results.len();
    let successful = results.iter().filter(|r| r.success).count();
    let total_packets: usize = results
        .iter()
        .filter(|r| r.success)
        .map(|r| r.packet_count)
        .sum();
    let secs = elapsed.as_secs_f64();
    BatchReport {
        total_files,
        successful,
        failed: total_files - successful,
        total_packets,
        total_time_seconds: secs,
        error_summary: errors.get_summary(),
        degraded,
        halted,
        success_rate: if total_files > 0 {
            successful as f64 / total_files as f64 * 100.0
        } else {
            0.0
        },
        packets_per_second: if secs > 0.0 {
            total_packets as f64 / secs
        } else {
            0.0
        },
        peak_memory_mb,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_totals_add_up() {
        let results = vec![
            ProcessingResult::succeeded(
                PathBuf::from("a.pcap"),
                PathBuf::from("a.pcap.json"),
                7,
                Duration::from_millis(1),
            ),
            ProcessingResult::failed(
                PathBuf::from("b.pcap"),
                ErrorKind::Decode,
                "x",
                Duration::ZERO,
            ),
        ];
        let sink = ErrorSink::new(false);
        let report = build_report(&results, &sink, Duration::from_secs(2), false, None, 0.0);
        assert_eq!(report.successful + report.failed, report.total_files);
        assert_eq!(report.total_packets, 7);
        assert_eq!(report.success_rate, 50.0);
        assert_eq!(report.packets_per_second, 3.5);
    }

    #[test]
    fn worker_panic_at_join_is_reported() {
        let clean = std::thread::spawn(|| {});
        assert!(join_worker(clean, Path::new("a.pcap")));
        let panicked = std::thread::spawn(|| panic!("send side blew up"));
        assert!(!join_worker(panicked, Path::new("b.pcap")));
    }

    #[test]
    fn missing_root_is_batch_error() {
        let cfg = BatchConfig {
            input_root: PathBuf::from("/no/such/capture/dir"),
            ..BatchConfig::default()
        };
        let err = BatchOrchestrator::new(cfg).run().unwrap_err();
        assert!(matches!(err, BatchError::DirectoryNotFound(_)));
    }

    #[test]
    fn empty_dir_completes_with_empty_report() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = BatchConfig {
            input_root: dir.path().to_path_buf(),
            output_root: dir.path().join("out"),
            ..BatchConfig::default()
        };
        let outcome = BatchOrchestrator::new(cfg).run().unwrap();
        assert_eq!(outcome.state, BatchState::Completed);
        assert_eq!(outcome.scan.found_count, 0);
        assert_eq!(outcome.report.total_files, 0);
        assert!(outcome.results.is_empty());
    }
}
