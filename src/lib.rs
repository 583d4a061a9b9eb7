//! Capsweep: batch decoding of packet-capture directories into per-file JSON documents.

pub mod decode;
pub mod engine;
pub mod error;
pub mod pipeline;
pub mod resources;
pub mod types;
pub mod utils;

/// Re-export types for API
pub use error::{BatchError, ErrorKind};
pub use types::*;

pub use decode::{CaptureDecoder, DecodeError, DecodedCapture, LayerRegistry, PacketDecoder};
pub use pipeline::{BatchOrchestrator, ErrorSink, PathDiscoverer};
pub use resources::{ResourceGovernor, ResourceProbe};

use log::debug;

/// Single entry point: decode every capture under `cfg.input_root` with the built-in decoder.
///
/// For a custom decoder, governor or cancel flag, build a [`BatchOrchestrator`] directly.
pub fn process_dir(cfg: BatchConfig) -> Result<BatchOutcome, BatchError> {
    debug!(
        "{} CONFIG:{:#?}",
        env!("CARGO_PKG_NAME").to_string().to_uppercase(),
        cfg
    );
    BatchOrchestrator::new(cfg).run()
}

/// Scan only: the files a batch over `cfg` would process, without decoding anything.
pub fn scan_dir(cfg: &BatchConfig) -> Result<(Vec<DiscoveredFile>, ScanStatistics), BatchError> {
    PathDiscoverer::from_config(cfg).scan(&cfg.input_root, cfg.max_depth)
}
