//! Decode collaborator boundary.
//!
//! The orchestrator only sees [`PacketDecoder`]: a path (plus optional packet cap) goes in, a
//! [`DecodedCapture`] with explicit packet/layer records comes out, or a [`DecodeError`].
//! [`CaptureDecoder`] is the built-in implementation (classic pcap and pcapng, layers from a
//! [`LayerRegistry`]); tests and embedders can supply their own.

pub mod capture;
pub mod layers;

pub use capture::{CaptureDecoder, CaptureFormat, decode_capture_bytes};
pub use layers::{LayerDissection, LayerHandler, LayerRegistry};

use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::error::ErrorKind;

/// Field name → value for one layer.
pub type FieldMap = BTreeMap<String, serde_json::Value>;

/// One protocol's parsed fields within a packet.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Layer {
    pub protocol: String,
    pub fields: FieldMap,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

/// One decoded packet. `id` is 1-based in file order.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Packet {
    pub id: u64,
    /// Seconds since the Unix epoch.
    pub timestamp: f64,
    /// Original length on the wire.
    pub size: u32,
    /// Bytes actually stored in the capture.
    pub captured_size: u32,
    /// Outermost layer first.
    pub layers: Vec<Layer>,
    pub summary: String,
}

impl Packet {
    pub fn protocols(&self) -> impl Iterator<Item = &str> {
        self.layers.iter().map(|l| l.protocol.as_str())
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct FileInfo {
    pub name: String,
    pub size: u64,
    pub packet_count: usize,
    pub format: CaptureFormat,
    /// Link-layer header type of the first interface (LINKTYPE_* value).
    pub link_type: u32,
}

/// Everything the decoder produced for one file.
#[derive(Clone, Debug)]
pub struct DecodedCapture {
    pub packets: Vec<Packet>,
    pub file_info: FileInfo,
    /// Packet-level problems that did not fail the file (truncated tail, malformed layer).
    pub warnings: Vec<String>,
}

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("cannot read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("not a recognized capture file: {reason}")]
    InvalidFormat { reason: String },

    #[error("packet #{index}: {reason}")]
    Packet { index: u64, reason: String },

    #[error("decoder failure: {0}")]
    Collaborator(String),
}

impl DecodeError {
    pub fn io(path: &Path, source: std::io::Error) -> Self {
        DecodeError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        DecodeError::InvalidFormat {
            reason: reason.into(),
        }
    }

    /// Classification recorded for the failed file.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DecodeError::Io { source, .. } => ErrorKind::from_io(source, ErrorKind::Decode),
            DecodeError::InvalidFormat { .. } => ErrorKind::InvalidFileFormat,
            DecodeError::Packet { .. } => ErrorKind::PacketDecode,
            DecodeError::Collaborator(_) => ErrorKind::Decode,
        }
    }
}

/// The decode collaborator. Implementations must be shareable across worker threads.
pub trait PacketDecoder: Send + Sync {
    /// Decode `path`, reading at most `max_packets` packets when set (early exit, not an error).
    fn decode(&self, path: &Path, max_packets: Option<usize>)
    -> Result<DecodedCapture, DecodeError>;

    /// Drop any cached buffers. Called from the resource governor's cleanup.
    fn release_buffers(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_error_kinds() {
        assert_eq!(
            DecodeError::invalid("bad magic").kind(),
            ErrorKind::InvalidFileFormat
        );
        assert_eq!(
            DecodeError::Packet {
                index: 3,
                reason: "short".into()
            }
            .kind(),
            ErrorKind::PacketDecode
        );
        let denied = DecodeError::io(
            Path::new("/x.pcap"),
            std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        );
        assert_eq!(denied.kind(), ErrorKind::Permission);
        let missing = DecodeError::io(
            Path::new("/x.pcap"),
            std::io::Error::from(std::io::ErrorKind::NotFound),
        );
        assert_eq!(missing.kind(), ErrorKind::Decode);
    }
}
