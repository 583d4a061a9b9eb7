//! One unit of work: decode a file, summarize it, write its document. Never fails past its boundary.

use log::{debug, warn};
use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant};

use crate::decode::PacketDecoder;
use crate::engine::output::OutputWriter;
use crate::engine::stats::CaptureStatistics;
use crate::error::ErrorKind;
use crate::types::ProcessingResult;

const RUNNING: u8 = 0;
const COMMITTING: u8 = 1;
const ABANDONED: u8 = 2;

/// Decides who finishes a task: the worker publishing its document, or the orchestrator giving up
/// on it after a timeout. Only one of the two transitions out of running can succeed.
#[derive(Debug, Default)]
pub struct TaskGate(AtomicU8);

impl TaskGate {
    pub fn new() -> Self {
        Self(AtomicU8::new(RUNNING))
    }

    /// Worker side: claim the right to publish. Fails once the task was abandoned.
    pub fn try_commit(&self) -> bool {
        self.0
            .compare_exchange(RUNNING, COMMITTING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Orchestrator side: give up on the task. Fails once the worker started committing.
    pub fn try_abandon(&self) -> bool {
        self.0
            .compare_exchange(RUNNING, ABANDONED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_abandoned(&self) -> bool {
        self.0.load(Ordering::Acquire) == ABANDONED
    }
}

pub struct FileDecodeTask {
    decoder: Arc<dyn PacketDecoder>,
    writer: OutputWriter,
}

impl FileDecodeTask {
    pub fn new(decoder: Arc<dyn PacketDecoder>, writer: OutputWriter) -> Self {
        Self { decoder, writer }
    }

    /// Decode `path` (at most `max_packets`) and write the document to `output_path` on success.
    ///
    /// Decoder errors and panics come back as a failed result. The document is staged in a temp
    /// file and only renamed into place after `gate` is committed; an abandoned task leaves nothing.
    pub fn run(
        &self,
        path: &Path,
        output_path: &Path,
        max_packets: Option<usize>,
        gate: &TaskGate,
    ) -> ProcessingResult {
        let start = Instant::now();
        let decoded = catch_unwind(AssertUnwindSafe(|| self.decoder.decode(path, max_packets)));
        let mut decoded = match decoded {
            Ok(Ok(d)) => d,
            Ok(Err(e)) => {
                debug!("Decode failed for {}: {}", path.display(), e);
                return ProcessingResult::failed(
                    path.to_path_buf(),
                    e.kind(),
                    e.to_string(),
                    start.elapsed(),
                );
            }
            Err(payload) => {
                let msg = format!("decoder panicked: {}", panic_message(payload.as_ref()));
                warn!("{}: {}", path.display(), msg);
                return ProcessingResult::failed(
                    path.to_path_buf(),
                    ErrorKind::Decode,
                    msg,
                    start.elapsed(),
                );
            }
        };
        if let Some(cap) = max_packets
            && decoded.packets.len() > cap
        {
            decoded.packets.truncate(cap);
        }
        decoded.file_info.packet_count = decoded.packets.len();
        let decode_time = start.elapsed();

        if gate.is_abandoned() {
            return abandoned(path, decode_time);
        }

        let stats = CaptureStatistics::from_packets(&decoded.packets);
        let staged = match self.writer.stage(
            output_path,
            path,
            &decoded,
            &stats,
            decode_time,
            &|| gate.is_abandoned(),
        ) {
            Ok(staged) => staged,
            Err(_) if gate.is_abandoned() => return abandoned(path, start.elapsed()),
            Err(e) => return write_failed(path, e, start.elapsed()),
        };
        if !gate.try_commit() {
            staged.discard();
            return abandoned(path, start.elapsed());
        }
        if let Err(e) = staged.commit() {
            return write_failed(path, e, start.elapsed());
        }

        let mut result = ProcessingResult::succeeded(
            path.to_path_buf(),
            output_path.to_path_buf(),
            decoded.packets.len(),
            start.elapsed(),
        );
        result.warnings = decoded.warnings;
        result.protocols = stats.unique_protocols;
        result
    }
}

fn abandoned(path: &Path, elapsed: Duration) -> ProcessingResult {
    debug!("{}: abandoned after timeout, output discarded", path.display());
    ProcessingResult::failed(
        path.to_path_buf(),
        ErrorKind::Timeout,
        "abandoned after timeout",
        elapsed,
    )
}

fn write_failed(path: &Path, e: anyhow::Error, elapsed: Duration) -> ProcessingResult {
    let kind = e
        .downcast_ref::<std::io::Error>()
        .map(|io| ErrorKind::from_io(io, ErrorKind::Output))
        .unwrap_or(ErrorKind::Output);
    ProcessingResult::failed(path.to_path_buf(), kind, format!("{e:#}"), elapsed)
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
