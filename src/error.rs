//! Error taxonomy: batch-scoped failures (returned from a run) and file-scoped kinds (recorded as data).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Failures that end a whole batch. Everything file-scoped is converted to an [`ErrorKind`] instead.
#[derive(Error, Debug)]
pub enum BatchError {
    #[error("directory not found: {}", .0.display())]
    DirectoryNotFound(PathBuf),

    #[error("not enough disk space for output under {}: {reason}", .path.display())]
    DiskSpace { path: PathBuf, reason: String },

    #[error("invalid configuration: {}", .0.join("; "))]
    InvalidConfig(Vec<String>),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Classification attached to every failed file and every [`ErrorRecord`](crate::ErrorRecord).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ErrorKind {
    #[serde(rename = "DirectoryNotFoundError")]
    DirectoryNotFound,
    #[serde(rename = "PermissionError")]
    Permission,
    #[serde(rename = "InvalidFileFormatError")]
    InvalidFileFormat,
    #[serde(rename = "DecodeError")]
    Decode,
    #[serde(rename = "PacketDecodeError")]
    PacketDecode,
    #[serde(rename = "MemoryError")]
    Memory,
    #[serde(rename = "DiskSpaceError")]
    DiskSpace,
    #[serde(rename = "TimeoutError")]
    Timeout,
    #[serde(rename = "OutputError")]
    Output,
    #[serde(rename = "CancelledError")]
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::DirectoryNotFound => "DirectoryNotFoundError",
            ErrorKind::Permission => "PermissionError",
            ErrorKind::InvalidFileFormat => "InvalidFileFormatError",
            ErrorKind::Decode => "DecodeError",
            ErrorKind::PacketDecode => "PacketDecodeError",
            ErrorKind::Memory => "MemoryError",
            ErrorKind::DiskSpace => "DiskSpaceError",
            ErrorKind::Timeout => "TimeoutError",
            ErrorKind::Output => "OutputError",
            ErrorKind::Cancelled => "CancelledError",
        }
    }

    /// Resource kinds come from admission control rather than from decoding the file.
    pub fn is_resource(&self) -> bool {
        matches!(self, ErrorKind::Memory | ErrorKind::DiskSpace)
    }

    /// Map an I/O failure to the closest kind. Used for both reads (decode) and writes (output).
    pub fn from_io(err: &std::io::Error, fallback: ErrorKind) -> ErrorKind {
        match err.kind() {
            std::io::ErrorKind::PermissionDenied => ErrorKind::Permission,
            std::io::ErrorKind::StorageFull => ErrorKind::DiskSpace,
            _ => fallback,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
