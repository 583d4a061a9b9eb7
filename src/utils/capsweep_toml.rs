//! Load `.capsweep.toml` from the input root (CLI only). Lib callers build [`BatchConfig`] directly.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::utils::config::PackagePaths;
use crate::{BatchConfig, ErrorPolicy};

#[derive(Debug, Default, Deserialize)]
pub(crate) struct CapsweepToml {
    #[serde(default)]
    settings: SettingsSection,
}

#[derive(Debug, Default, Deserialize)]
struct SettingsSection {
    output: Option<String>,
    jobs: Option<usize>,
    max_packets: Option<usize>,
    max_depth: Option<usize>,
    extensions: Option<Vec<String>>,
    error_policy: Option<ErrorPolicy>,
    timeout: Option<u64>,
    memory_limit: Option<f64>,
    max_disk_usage: Option<f64>,
    max_file_size: Option<f64>,
    streaming_threshold: Option<usize>,
    error_report: Option<bool>,
    summary_report: Option<bool>,
    follow_links: Option<bool>,
    verbose: Option<bool>,
}

/// Load the settings file from `dir` if present. Returns None if missing or unreadable.
pub(crate) fn load_capsweep_toml(dir: &Path) -> Option<CapsweepToml> {
    let path = dir.join(PackagePaths::get().config_filename());
    let s = std::fs::read_to_string(&path).ok()?;
    parse_capsweep_toml(&s)
        .map_err(|e| log::warn!("{}: {}", path.display(), e))
        .ok()
}

pub(crate) fn parse_capsweep_toml(s: &str) -> Result<CapsweepToml, toml::de::Error> {
    toml::from_str(s)
}

/// Overwrite config field from file when present.
macro_rules! apply_file_opt {
    ($section:expr, $cfg:expr, $file_field:ident => $cfg_field:ident) => {
        if let Some(v) = $section.$file_field.clone() {
            $cfg.$cfg_field = v;
        }
    };
}

/// Apply file settings to `cfg` (only fields present in the file). Call before applying CLI flags.
/// `dry_run` is never read from the file.
pub(crate) fn apply_file_to_config(file: &CapsweepToml, cfg: &mut BatchConfig) {
    let s = &file.settings;
    if let Some(ref p) = s.output {
        cfg.output_root = PathBuf::from(p);
    }
    apply_file_opt!(s, cfg, jobs => max_workers);
    if let Some(n) = s.max_packets {
        cfg.max_packets = Some(n);
    }
    apply_file_opt!(s, cfg, max_depth => max_depth);
    if let Some(ref exts) = s.extensions {
        cfg.extensions = exts
            .iter()
            .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
            .collect();
    }
    apply_file_opt!(s, cfg, error_policy => error_policy);
    if let Some(secs) = s.timeout {
        cfg.task_timeout = (secs > 0).then(|| Duration::from_secs(secs));
    }
    if let Some(mb) = s.memory_limit {
        cfg.memory_limit_mb = Some(mb);
    }
    apply_file_opt!(s, cfg, max_disk_usage => max_disk_usage_percent);
    if let Some(mb) = s.max_file_size {
        cfg.max_file_size_mb = Some(mb);
    }
    apply_file_opt!(s, cfg, streaming_threshold => streaming_threshold);
    apply_file_opt!(s, cfg, error_report => error_report);
    apply_file_opt!(s, cfg, summary_report => summary_report);
    apply_file_opt!(s, cfg, follow_links => follow_links);
    apply_file_opt!(s, cfg, verbose => verbose);
}
