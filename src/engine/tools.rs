//! Path and filter utilities

use std::path::{Path, PathBuf};

use crate::error::BatchError;

/// Convert absolute path to relative path from base
pub fn path_relative_to(path: &Path, base: &Path) -> Option<PathBuf> {
    path.strip_prefix(base).ok().map(|p| p.to_path_buf())
}

/// Check if a file should be excluded based on OS-specific hidden files
pub fn is_os_hidden_file(path: &Path) -> bool {
    if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
        match name {
            // macOS
            ".DS_Store" | ".AppleDouble" | ".LSOverride" => true,
            // Windows
            "Thumbs.db" | "ehthumbs.db" | "Desktop.ini" | "$RECYCLE.BIN" => true,
            // Linux
            ".directory" => true,
            _ => {
                // macOS resource fork files start with ._
                name.starts_with("._") || name.starts_with(".Trash-")
            }
        }
    } else {
        false
    }
}

/// True when the extension (case-insensitive, no dot) is in `extensions`.
pub fn has_capture_extension(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| extensions.iter().any(|want| want.eq_ignore_ascii_case(ext)))
}

/// Where the document for `input` goes: same relative directory under `output_root`, with
/// `.json` appended to the full file name so `a.pcap` and `a.pcapng` never collide.
pub fn output_path_for(input: &Path, input_root: &Path, output_root: &Path) -> PathBuf {
    let rel = path_relative_to(input, input_root).unwrap_or_else(|| {
        input
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| input.to_path_buf())
    });
    let mut name = rel
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".json");
    match rel.parent() {
        Some(parent) => output_root.join(parent).join(name),
        None => output_root.join(name),
    }
}

/// Canonical scan root. Missing or non-directory roots end the batch.
pub fn canonical_root(path: &Path) -> Result<PathBuf, BatchError> {
    match path.canonicalize() {
        Ok(p) if p.is_dir() => Ok(p),
        _ => Err(BatchError::DirectoryNotFound(path.to_path_buf())),
    }
}

/// True if the process is running with effective uid 0 (e.g. via sudo).
#[cfg(unix)]
pub fn running_as_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

#[cfg(not(unix))]
pub fn running_as_root() -> bool {
    false
}

/// Seconds since the Unix epoch, microsecond resolution.
pub fn unix_now() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1e6
}

/// Human-readable byte count for logs and the dry-run listing.
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_match_ignores_case() {
        let exts = vec!["pcap".to_string(), "pcapng".to_string()];
        assert!(has_capture_extension(Path::new("/x/a.PCAP"), &exts));
        assert!(has_capture_extension(Path::new("b.pcapng"), &exts));
        assert!(!has_capture_extension(Path::new("c.txt"), &exts));
        assert!(!has_capture_extension(Path::new("pcap"), &exts));
    }

    #[test]
    fn output_path_mirrors_relative_dirs() {
        let out = output_path_for(
            Path::new("/in/site1/a.pcap"),
            Path::new("/in"),
            Path::new("/out"),
        );
        assert_eq!(out, PathBuf::from("/out/site1/a.pcap.json"));
        let top = output_path_for(Path::new("/in/b.cap"), Path::new("/in"), Path::new("/out"));
        assert_eq!(top, PathBuf::from("/out/b.cap.json"));
    }

    #[test]
    fn hidden_os_files() {
        assert!(is_os_hidden_file(Path::new("/x/.DS_Store")));
        assert!(is_os_hidden_file(Path::new("/x/._a.pcap")));
        assert!(!is_os_hidden_file(Path::new("/x/a.pcap")));
    }

    #[test]
    fn sizes_are_humanized() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(1536), "1.5 KB");
        assert_eq!(format_size(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn missing_root_is_directory_not_found() {
        let err = canonical_root(Path::new("/no/such/capsweep/root")).unwrap_err();
        assert!(matches!(err, BatchError::DirectoryNotFound(_)));
    }
}
