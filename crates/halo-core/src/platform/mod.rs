//! Platform abstraction layer.
//!
//! OS-specific path and process behavior lives here:
//! - `paths` - session-scoped directories and the registry location
//! - `process` - liveness probing, start times and killing of PIDs

pub mod paths;
pub mod process;

pub use paths::{registry_db_path, runtime_dir};
pub use process::{
    is_process_alive, kill_process, kill_process_group, process_start_time, wait_for_exit,
};
