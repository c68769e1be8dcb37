//! Platform-specific path utilities.
//!
//! The registry is session-scoped, so it lives in the per-login runtime
//! directory when the platform has one.

use crate::config::RegistryConfig;
use crate::error::{HaloError, Result};
use std::path::PathBuf;

/// Directory holding Halo's session state.
///
/// # Platform Behavior
/// - **Linux**: `$XDG_RUNTIME_DIR/halo`
/// - **Others** (or no runtime dir): `{cache_dir}/halo`
pub fn runtime_dir() -> Result<PathBuf> {
    let base = dirs::runtime_dir()
        .or_else(dirs::cache_dir)
        .ok_or_else(|| HaloError::Config {
            message: "Could not determine a runtime or cache directory".to_string(),
        })?;
    Ok(base.join(RegistryConfig::APP_DIR_NAME))
}

/// Path to the instance registry database.
///
/// `HALO_REGISTRY_PATH` wins when set and non-empty.
pub fn registry_db_path() -> Result<PathBuf> {
    if let Some(path) = std::env::var_os(RegistryConfig::REGISTRY_PATH_ENV) {
        if !path.is_empty() {
            return Ok(PathBuf::from(path));
        }
    }
    Ok(runtime_dir()?.join(RegistryConfig::DB_FILENAME))
}
