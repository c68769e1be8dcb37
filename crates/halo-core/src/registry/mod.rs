//! Session-wide registry of running instances.
//!
//! A SQLite database maps each bus id (`io.Halo.<name>`) to the PID and
//! control port of the process that claimed it. The primary key on `bus_id`
//! is what makes names unique; rows whose PID is gone are stale and get
//! replaced by the next claimant.
//!
//! # Location
//!
//! - **Linux**: `$XDG_RUNTIME_DIR/halo/registry.db`
//! - **Elsewhere**: `{cache_dir}/halo/registry.db`
//! - Overridden by `HALO_REGISTRY_PATH`

pub mod instance_registry;

pub use instance_registry::{InstanceEntry, InstanceRegistry};
