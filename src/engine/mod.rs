//! Engine: per-file work (decode task, statistics, output documents), progress and the CLI surface.

pub mod arg_parser;
pub mod cli;
pub mod output;
pub mod progress;
pub mod report;
pub mod stats;
pub mod task;
pub mod tools;

// Re-export commonly used items
pub use arg_parser::Cli;
pub use cli::{build_config, handle_run};
pub use output::OutputWriter;
pub use progress::{ProgressSink, ProgressSnapshot};
pub use stats::CaptureStatistics;
pub use task::FileDecodeTask;
pub use tools::{output_path_for, path_relative_to};
