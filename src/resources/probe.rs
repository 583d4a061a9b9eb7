//! Process memory and disk readings via sysinfo.

use log::debug;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use sysinfo::{Disks, Pid, ProcessRefreshKind, ProcessesToUpdate, System};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Space on the disk holding a path, in bytes.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DiskSpace {
    pub total_bytes: u64,
    pub available_bytes: u64,
}

impl DiskSpace {
    pub fn used_percent(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        let used = self.total_bytes.saturating_sub(self.available_bytes);
        used as f64 / self.total_bytes as f64 * 100.0
    }

    pub fn free_percent(&self) -> f64 {
        100.0 - self.used_percent()
    }

    /// Used percentage after another `extra_mb` has been written.
    pub fn used_percent_after(&self, extra_mb: f64) -> f64 {
        if self.total_bytes == 0 {
            return 100.0;
        }
        let extra = (extra_mb.max(0.0) * BYTES_PER_MB) as u64;
        let used = self
            .total_bytes
            .saturating_sub(self.available_bytes)
            .saturating_add(extra);
        used as f64 / self.total_bytes as f64 * 100.0
    }
}

/// Source of resource readings. Swappable so admission control can be driven in tests.
pub trait ResourceProbe: Send + Sync {
    /// Resident memory of this process in MB.
    fn memory_used_mb(&self) -> f64;

    /// Space on the disk that holds `path`. `None` when no mounted disk matches.
    fn disk_space(&self, path: &Path) -> Option<DiskSpace>;
}

/// Live readings from the OS.
pub struct SysinfoProbe {
    system: Mutex<System>,
    pid: Option<Pid>,
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl SysinfoProbe {
    pub fn new() -> Self {
        let pid = sysinfo::get_current_pid()
            .map_err(|e| debug!("Cannot resolve own pid: {}", e))
            .ok();
        Self {
            system: Mutex::new(System::new()),
            pid,
        }
    }
}

impl ResourceProbe for SysinfoProbe {
    fn memory_used_mb(&self) -> f64 {
        let Some(pid) = self.pid else {
            return 0.0;
        };
        let mut sys = self.system.lock().unwrap_or_else(|e| e.into_inner());
        sys.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::nothing().with_memory(),
        );
        sys.process(pid)
            .map(|p| p.memory() as f64 / BYTES_PER_MB)
            .unwrap_or(0.0)
    }

    fn disk_space(&self, path: &Path) -> Option<DiskSpace> {
        let target = nearest_existing_ancestor(path);
        let disks = Disks::new_with_refreshed_list();
        let path_str = target.to_string_lossy();
        let disk = disks
            .iter()
            .filter(|d| path_str.starts_with(d.mount_point().to_string_lossy().as_ref()))
            .max_by_key(|d| d.mount_point().to_string_lossy().len());
        match disk {
            Some(disk) => {
                debug!(
                    "Disk for {}: mount={}, fs={}, available={}",
                    target.display(),
                    disk.mount_point().display(),
                    disk.file_system().to_string_lossy(),
                    disk.available_space()
                );
                Some(DiskSpace {
                    total_bytes: disk.total_space(),
                    available_bytes: disk.available_space(),
                })
            }
            None => {
                debug!("No disk found for path: {}", target.display());
                None
            }
        }
    }
}

/// The output root may not exist yet; measure the closest ancestor that does.
fn nearest_existing_ancestor(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };
    absolute
        .ancestors()
        .find_map(|p| p.canonicalize().ok())
        .unwrap_or(absolute)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn used_percent_after_adds_required_space() {
        let space = DiskSpace {
            total_bytes: 100 * 1024 * 1024,
            available_bytes: 50 * 1024 * 1024,
        };
        assert!((space.used_percent() - 50.0).abs() < 1e-9);
        assert!((space.used_percent_after(25.0) - 75.0).abs() < 1e-9);
        assert!((space.free_percent() - 50.0).abs() < 1e-9);
    }

    #[test]
    fn ancestor_of_missing_dir_exists() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("a/b/c");
        let found = nearest_existing_ancestor(&missing);
        assert_eq!(found, dir.path().canonicalize().unwrap());
    }

    #[test]
    fn sysinfo_probe_reads_own_memory() {
        let probe = SysinfoProbe::new();
        assert!(probe.memory_used_mb() >= 0.0);
    }
}
