//! Batch progress: lock-free counters plus an optional kdam bar for the terminal.

use kdam::{Animation, Bar, BarExt};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

// Progress bar type alias
pub type ProgressBar = Arc<Mutex<Bar>>;

/// Configuration for creating a progress bar
pub struct ProgressBarConfig {
    pub total: usize,
    pub desc: &'static str,
    pub animation: Animation,
}

impl ProgressBarConfig {
    /// Create a new progress bar configuration
    pub fn new(total: usize, desc: &'static str, animation: Animation) -> Self {
        Self {
            total,
            desc,
            animation,
        }
    }
}

/// Create a progress bar with the given configuration
pub fn create_progress_bar(config: ProgressBarConfig) -> ProgressBar {
    Arc::new(Mutex::new(kdam::tqdm!(
        total = config.total,
        desc = config.desc,
        animation = config.animation,
        unit = " files"
    )))
}

/// Update progress bar if available
/// Uses try_lock to avoid blocking if mutex is contended (non-blocking)
pub fn update_progress_bar(pb: &ProgressBar, n: usize, postfix: Option<&str>) {
    // If lock is contended, skip update (progress bar will catch up on next update)
    if let Ok(mut pb) = pb.try_lock() {
        if let Some(text) = postfix {
            pb.set_postfix(text);
        }
        let _ = pb.update(n);
    }
}

/// Point-in-time view of batch progress.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    /// Finished units, successful or not.
    pub completed: usize,
    /// Subset of `completed` that failed.
    pub failed: usize,
    pub in_flight: usize,
    pub total: usize,
    /// Completions per second since the sink was created.
    pub rate: f64,
}

/// Shared across the orchestrator and workers; every counter is atomic.
pub struct ProgressSink {
    total: usize,
    completed: AtomicUsize,
    failed: AtomicUsize,
    in_flight: AtomicUsize,
    started: Instant,
    closed: AtomicBool,
    bar: Option<ProgressBar>,
}

impl ProgressSink {
    /// Counters only; no terminal output.
    pub fn new(total: usize) -> Self {
        Self {
            total,
            completed: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            started: Instant::now(),
            closed: AtomicBool::new(false),
            bar: None,
        }
    }

    /// Counters plus a kdam bar.
    pub fn with_bar(total: usize) -> Self {
        let bar = create_progress_bar(ProgressBarConfig::new(
            total,
            "Decoding",
            Animation::Classic,
        ));
        Self {
            bar: Some(bar),
            ..Self::new(total)
        }
    }

    /// A unit was admitted.
    pub fn started(&self) {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
    }

    /// A previously admitted unit stopped running without finishing (timeout abandon).
    fn leave_flight(&self) {
        let _ = self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    /// Record `delta` finished units. `current_file` is shown on the bar when present.
    pub fn update(&self, delta: usize, current_file: Option<&str>) {
        self.completed.fetch_add(delta, Ordering::AcqRel);
        if let Some(bar) = &self.bar {
            update_progress_bar(bar, delta, current_file);
        }
    }

    /// One admitted unit finished.
    pub fn finish_one(&self, success: bool, current_file: Option<&str>) {
        self.leave_flight();
        if !success {
            self.failed.fetch_add(1, Ordering::AcqRel);
        }
        self.update(1, current_file);
    }

    /// One unit failed without ever being admitted (excluded or cancelled).
    pub fn skip_one(&self, current_file: Option<&str>) {
        self.failed.fetch_add(1, Ordering::AcqRel);
        self.update(1, current_file);
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let completed = self.completed.load(Ordering::Acquire);
        let elapsed = self.started.elapsed().as_secs_f64();
        ProgressSnapshot {
            completed,
            failed: self.failed.load(Ordering::Acquire),
            in_flight: self.in_flight.load(Ordering::Acquire),
            total: self.total,
            rate: if elapsed > 0.0 {
                completed as f64 / elapsed
            } else {
                0.0
            },
        }
    }

    /// Finish the bar. Later calls do nothing.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(bar) = &self.bar {
            let mut bar = bar.lock().unwrap_or_else(|e| e.into_inner());
            let _ = bar.refresh();
            eprintln!();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn concurrent_updates_are_not_lost() {
        let sink = Arc::new(ProgressSink::new(800));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let sink = Arc::clone(&sink);
                thread::spawn(move || {
                    for i in 0..100 {
                        sink.started();
                        sink.finish_one(i % 10 != 0, None);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let snap = sink.snapshot();
        assert_eq!(snap.completed, 800);
        assert_eq!(snap.failed, 80);
        assert_eq!(snap.in_flight, 0);
        assert_eq!(snap.total, 800);
    }

    #[test]
    fn in_flight_never_underflows() {
        let sink = ProgressSink::new(1);
        sink.finish_one(true, Some("a.pcap"));
        assert_eq!(sink.snapshot().in_flight, 0);
        sink.close();
        sink.close();
    }
}
