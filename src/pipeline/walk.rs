//! Bounded-depth discovery of capture files under a root directory.

use log::{debug, warn};
use std::path::{Path, PathBuf};
use std::time::Instant;
use walkdir::WalkDir;

use crate::engine::tools::{canonical_root, has_capture_extension, is_os_hidden_file};
use crate::error::BatchError;
use crate::types::{BatchConfig, DiscoveredFile, ScanStatistics};

/// One result from a directory walk: either an entry to consider or an error with optional path.
pub enum WalkOutcome {
    Ok(walkdir::DirEntry),
    Err { msg: String, path: Option<PathBuf> },
}

/// Convert a walkdir result into [`WalkOutcome`].
pub fn to_outcome_walkdir(r: Result<walkdir::DirEntry, walkdir::Error>) -> WalkOutcome {
    match r {
        Ok(entry) => WalkOutcome::Ok(entry),
        Err(err) => WalkOutcome::Err {
            msg: format!("{}", err),
            path: err.path().map(PathBuf::from),
        },
    }
}

/// Finds candidate files. Depth 0 is the root's direct children.
#[derive(Clone, Debug)]
pub struct PathDiscoverer {
    extensions: Vec<String>,
    follow_links: bool,
}

impl PathDiscoverer {
    pub fn new(extensions: Vec<String>, follow_links: bool) -> Self {
        Self {
            extensions,
            follow_links,
        }
    }

    pub fn from_config(cfg: &BatchConfig) -> Self {
        Self::new(cfg.extensions.clone(), cfg.follow_links)
    }

    /// Files at depth `<= max_depth` whose extension is allowed, sorted by path.
    ///
    /// Only a missing or non-directory root is an error. Unreadable entries are counted in
    /// `error_path_count`; directories at the depth limit are counted as ignored and not entered.
    pub fn scan(
        &self,
        root: &Path,
        max_depth: usize,
    ) -> Result<(Vec<DiscoveredFile>, ScanStatistics), BatchError> {
        let start = Instant::now();
        let root = canonical_root(root)?;
        let walk_limit = max_depth + 1;
        let iter = WalkDir::new(&root)
            .follow_links(self.follow_links)
            .min_depth(1)
            .max_depth(walk_limit)
            .sort_by_file_name()
            .into_iter()
            .map(to_outcome_walkdir);

        let mut files = Vec::new();
        let mut stats = ScanStatistics::default();
        for outcome in iter {
            let entry = match outcome {
                WalkOutcome::Ok(entry) => entry,
                WalkOutcome::Err { msg, path } => {
                    warn!(
                        "Skipping unreadable path {}: {}",
                        path.as_deref()
                            .map(|p| p.display().to_string())
                            .unwrap_or_else(|| "<unknown>".to_string()),
                        msg
                    );
                    stats.error_path_count += 1;
                    continue;
                }
            };
            let file_type = entry.file_type();
            if file_type.is_dir() {
                if entry.depth() == walk_limit {
                    debug!("Not descending past depth limit: {}", entry.path().display());
                    stats.ignored_count += 1;
                }
                continue;
            }
            if !file_type.is_file()
                || is_os_hidden_file(entry.path())
                || !has_capture_extension(entry.path(), &self.extensions)
            {
                stats.ignored_count += 1;
                continue;
            }
            // min_depth(1) above, so depth >= 1 here.
            let depth = entry.depth() - 1;
            match entry.metadata() {
                Ok(meta) => files.push(DiscoveredFile {
                    path: entry.into_path(),
                    size_bytes: meta.len(),
                    depth,
                }),
                Err(e) => {
                    warn!("Cannot stat {}: {}", entry.path().display(), e);
                    stats.error_path_count += 1;
                }
            }
        }

        files.sort_by(|a, b| a.path.cmp(&b.path));
        stats.found_count = files.len();
        stats.total_processed = stats.found_count + stats.ignored_count + stats.error_path_count;
        stats.elapsed_seconds = start.elapsed().as_secs_f64();
        debug!(
            "Scan of {}: {} found, {} ignored, {} errors",
            root.display(),
            stats.found_count,
            stats.ignored_count,
            stats.error_path_count
        );
        Ok((files, stats))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn touch(root: &Path, rel: &str) {
        let p = root.join(rel);
        fs::create_dir_all(p.parent().unwrap()).unwrap();
        fs::write(p, b"x").unwrap();
    }

    fn discoverer() -> PathDiscoverer {
        PathDiscoverer::from_config(&BatchConfig::default())
    }

    #[test]
    fn filters_by_extension_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "b.pcap");
        touch(dir.path(), "a.PCAPNG");
        touch(dir.path(), "notes.txt");
        touch(dir.path(), ".DS_Store");
        let (files, stats) = discoverer().scan(dir.path(), 1).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|f| f.path.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.PCAPNG", "b.pcap"]);
        assert_eq!(stats.found_count, 2);
        assert_eq!(stats.ignored_count, 2);
        assert_eq!(stats.total_processed, 4);
        assert!(files.iter().all(|f| f.depth == 0 && f.size_bytes == 1));
    }

    #[test]
    fn depth_limit_is_inclusive() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "top.pcap");
        touch(dir.path(), "d1/one.pcap");
        touch(dir.path(), "d1/d2/two.pcap");
        let (files, stats) = discoverer().scan(dir.path(), 1).unwrap();
        let depths: Vec<_> = files.iter().map(|f| f.depth).collect();
        assert_eq!(files.len(), 2);
        assert!(depths.contains(&0) && depths.contains(&1));
        // d1/d2 sits at the limit and is not entered.
        assert_eq!(stats.ignored_count, 1);

        let (root_only, _) = discoverer().scan(dir.path(), 0).unwrap();
        assert_eq!(root_only.len(), 1);
    }

    #[test]
    fn root_must_be_a_directory() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "file.pcap");
        let err = discoverer()
            .scan(&dir.path().join("file.pcap"), 1)
            .unwrap_err();
        assert!(matches!(err, BatchError::DirectoryNotFound(_)));
    }

    #[cfg(unix)]
    #[test]
    fn unreadable_subdir_is_counted_not_fatal() {
        use std::os::unix::fs::PermissionsExt;
        if crate::engine::tools::running_as_root() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "ok.pcap");
        touch(dir.path(), "locked/hidden.pcap");
        let locked = dir.path().join("locked");
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();
        let result = discoverer().scan(dir.path(), 1);
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();
        let (files, stats) = result.unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(stats.error_path_count, 1);
    }
}
