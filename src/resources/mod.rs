//! Admission control: memory ceiling, output-disk headroom and best-effort cleanup.
//!
//! The governor never touches running work. The orchestrator asks it before each admission and
//! pauses or halts intake based on the answer.

pub mod probe;

pub use probe::{DiskSpace, ResourceProbe, SysinfoProbe};

use log::{debug, warn};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::engine::tools::unix_now;
use crate::{BatchConfig, ResourceSnapshot};

type CleanupHook = Box<dyn Fn() + Send + Sync>;

pub struct ResourceGovernor {
    probe: Arc<dyn ResourceProbe>,
    memory_limit_mb: Option<f64>,
    max_disk_usage_percent: f64,
    output_root: PathBuf,
    /// f64 bits of the highest memory reading seen.
    peak_memory_mb: AtomicU64,
    cleanups: Mutex<Vec<CleanupHook>>,
}

impl ResourceGovernor {
    /// Governor over live OS readings.
    pub fn new(cfg: &BatchConfig) -> Self {
        Self::with_probe(cfg, Arc::new(SysinfoProbe::new()))
    }

    pub fn with_probe(cfg: &BatchConfig, probe: Arc<dyn ResourceProbe>) -> Self {
        Self {
            probe,
            memory_limit_mb: cfg.memory_limit_mb,
            max_disk_usage_percent: cfg.max_disk_usage_percent,
            output_root: cfg.output_root.clone(),
            peak_memory_mb: AtomicU64::new(0f64.to_bits()),
            cleanups: Mutex::new(Vec::new()),
        }
    }

    fn sample_memory(&self) -> f64 {
        let used = self.probe.memory_used_mb();
        let mut current = self.peak_memory_mb.load(Ordering::Relaxed);
        while used > f64::from_bits(current) {
            match self.peak_memory_mb.compare_exchange_weak(
                current,
                used.to_bits(),
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(seen) => current = seen,
            }
        }
        used
    }

    /// True when process memory is under the ceiling, or no ceiling is set.
    pub fn check_memory(&self) -> bool {
        let used = self.sample_memory();
        match self.memory_limit_mb {
            Some(limit) if used >= limit => {
                debug!("Memory {:.1} MB at or over limit {:.1} MB", used, limit);
                false
            }
            _ => true,
        }
    }

    /// True when writing another `required_mb` to the output disk keeps usage within the limit.
    /// An unresolvable disk is not treated as full.
    pub fn check_disk_space(&self, required_mb: f64) -> bool {
        self.check_disk_space_at(&self.output_root, required_mb)
    }

    pub fn check_disk_space_at(&self, path: &Path, required_mb: f64) -> bool {
        let Some(space) = self.probe.disk_space(path) else {
            return true;
        };
        let after = space.used_percent_after(required_mb);
        if after > self.max_disk_usage_percent {
            debug!(
                "Disk usage would reach {:.1}% (limit {:.1}%) after {:.1} MB",
                after, self.max_disk_usage_percent, required_mb
            );
            return false;
        }
        true
    }

    pub fn snapshot(&self) -> ResourceSnapshot {
        ResourceSnapshot {
            memory_used_mb: self.sample_memory(),
            memory_limit_mb: self.memory_limit_mb,
            disk_free_percent: self
                .probe
                .disk_space(&self.output_root)
                .map(|s| s.free_percent()),
            disk_limit_percent: self.max_disk_usage_percent,
            sampled_at: unix_now(),
        }
    }

    /// Highest memory reading taken so far, in MB.
    pub fn peak_memory_mb(&self) -> f64 {
        f64::from_bits(self.peak_memory_mb.load(Ordering::Relaxed))
    }

    /// Add a hook run by [`cleanup`](Self::cleanup), e.g. a decoder releasing its buffers.
    pub fn register_cleanup<F>(&self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.cleanups
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Box::new(hook));
    }

    /// Run every registered hook. A panicking hook is logged and the rest still run.
    pub fn cleanup(&self) {
        let hooks = self.cleanups.lock().unwrap_or_else(|e| e.into_inner());
        for (i, hook) in hooks.iter().enumerate() {
            if catch_unwind(AssertUnwindSafe(|| hook())).is_err() {
                warn!("Cleanup hook #{} panicked; continuing", i);
            }
        }
        debug!("Ran {} cleanup hook(s)", hooks.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct FixedProbe {
        memory_mb: f64,
        space: Option<DiskSpace>,
    }

    impl ResourceProbe for FixedProbe {
        fn memory_used_mb(&self) -> f64 {
            self.memory_mb
        }

        fn disk_space(&self, _path: &Path) -> Option<DiskSpace> {
            self.space
        }
    }

    fn governor(memory_mb: f64, limit: Option<f64>, space: Option<DiskSpace>) -> ResourceGovernor {
        let cfg = BatchConfig {
            memory_limit_mb: limit,
            max_disk_usage_percent: 90.0,
            ..BatchConfig::default()
        };
        ResourceGovernor::with_probe(&cfg, Arc::new(FixedProbe { memory_mb, space }))
    }

    const MB: u64 = 1024 * 1024;

    #[test]
    fn memory_check_honors_limit() {
        assert!(governor(500.0, None, None).check_memory());
        assert!(governor(500.0, Some(1000.0), None).check_memory());
        assert!(!governor(1000.0, Some(1000.0), None).check_memory());
    }

    #[test]
    fn disk_check_accounts_for_required_space() {
        let space = DiskSpace {
            total_bytes: 1000 * MB,
            available_bytes: 200 * MB,
        };
        let g = governor(0.0, None, Some(space));
        assert!(g.check_disk_space(50.0));
        assert!(!g.check_disk_space(150.0));
    }

    #[test]
    fn unknown_disk_is_admitted() {
        assert!(governor(0.0, None, None).check_disk_space(1e9));
    }

    #[test]
    fn peak_memory_tracks_highest_sample() {
        let g = governor(321.0, None, None);
        g.check_memory();
        let snap = g.snapshot();
        assert_eq!(snap.memory_used_mb, 321.0);
        assert_eq!(g.peak_memory_mb(), 321.0);
        assert!(snap.disk_free_percent.is_none());
    }

    #[test]
    fn cleanup_survives_panicking_hook() {
        let g = governor(0.0, None, None);
        let calls = Arc::new(AtomicUsize::new(0));
        g.register_cleanup(|| panic!("hook failure"));
        let c = Arc::clone(&calls);
        g.register_cleanup(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        g.cleanup();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
