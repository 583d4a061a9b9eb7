//! Pipeline components: discovery, error collection, workers and the batch orchestrator.

pub mod context;
pub mod error_sink;
pub mod orchestrator;
pub mod walk;
pub mod worker;

pub use context::{DispatchContext, InFlight, TaskMessage};
pub use error_sink::{ErrorReport, ErrorSink};
pub use orchestrator::{BatchOrchestrator, build_report};
pub use walk::{PathDiscoverer, WalkOutcome, to_outcome_walkdir};
pub use worker::spawn_decode_worker;
