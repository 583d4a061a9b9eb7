use crossbeam_channel::Sender;
use log::{debug, warn};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use super::context::{DispatchContext, TaskMessage};
use crate::engine::task::{TaskGate, panic_message};
use crate::error::ErrorKind;
use crate::types::ProcessingResult;

/// Start one decode worker for file `index`. The worker sends exactly one [`TaskMessage`] and exits.
/// A closed channel (orchestrator gone) is not an error; the result is dropped.
pub fn spawn_decode_worker(
    ctx: Arc<DispatchContext>,
    index: usize,
    path: PathBuf,
    output_path: PathBuf,
    gate: Arc<TaskGate>,
    result_tx: Sender<TaskMessage>,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("decode-{index}"))
        .spawn(move || {
            let start = Instant::now();
            let run = catch_unwind(AssertUnwindSafe(|| {
                ctx.task.run(&path, &output_path, ctx.max_packets, &gate)
            }));
            let result = run.unwrap_or_else(|payload| {
                let msg = format!("task panicked: {}", panic_message(payload.as_ref()));
                warn!("{}: {}", path.display(), msg);
                ProcessingResult::failed(path.clone(), ErrorKind::Decode, msg, start.elapsed())
            });
            if result_tx.send(TaskMessage { index, result }).is_err() {
                debug!("Result for {} dropped: orchestrator gone", path.display());
            }
        })
}
