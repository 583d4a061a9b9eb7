pub mod capsweep_toml;
pub mod config;
pub mod fd_limit;
pub mod logger;
pub mod tempfiles;

pub use config::*;
pub use fd_limit::{FDS_PER_WORKER, determine_workers_given_fd_limit, max_open_fds};
pub use logger::{Colors, setup_logging};
pub use tempfiles::{remove_stale_temp, rename_temp_to_final, temp_path_for};
