//! Shared state handed to every decode worker, and the message a worker sends back.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use crate::engine::task::{FileDecodeTask, TaskGate};
use crate::types::ProcessingResult;

/// Read-only context shared (behind an `Arc`) by all workers of one batch.
pub struct DispatchContext {
    pub task: FileDecodeTask,
    pub max_packets: Option<usize>,
}

/// What a worker sends when its file is done. `index` is the file's position in discovery order.
pub struct TaskMessage {
    pub index: usize,
    pub result: ProcessingResult,
}

/// Orchestrator-side bookkeeping for one admitted file.
pub struct InFlight {
    pub path: PathBuf,
    pub started: Instant,
    /// Shared with the worker; decides between publishing the output and a timeout.
    pub gate: Arc<TaskGate>,
    pub handle: JoinHandle<()>,
}
