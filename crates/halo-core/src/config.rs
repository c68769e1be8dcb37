//! Centralized configuration for Halo.
//!
//! Constants for the instance registry, the control bus and the variable
//! engine. Runtime overrides are limited to the registry location
//! (`HALO_REGISTRY_PATH`) and the CLI flags built on top of this crate.

use std::time::Duration;

/// Instance registry and transport configuration.
pub struct RegistryConfig;

impl RegistryConfig {
    /// Prefix every bus id carries: `io.Halo.<name>`.
    pub const NAMESPACE: &'static str = "io.Halo";
    pub const APP_DIR_NAME: &'static str = "halo";
    pub const DB_FILENAME: &'static str = "registry.db";
    /// Environment variable that overrides the registry database path.
    pub const REGISTRY_PATH_ENV: &'static str = "HALO_REGISTRY_PATH";
    pub const BUSY_TIMEOUT_MS: u64 = 5_000;
    pub const MAX_NAME_LEN: usize = 128;

    // IPC framing and limits
    pub const MAX_IPC_MESSAGE_SIZE: usize = 16 * 1024 * 1024; // 16MB
    pub const MAX_IPC_CONNECTIONS: usize = 64;
    pub const IPC_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
}

/// Control client configuration.
pub struct ControlConfig;

impl ControlConfig {
    /// Default bound on a single call. `None` waits for the transport.
    pub const DEFAULT_CALL_TIMEOUT: Option<Duration> = None;
    /// How long a dropped `Quit` call waits for the remote PID to disappear.
    pub const QUIT_EXIT_GRACE: Duration = Duration::from_secs(2);
    pub const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(25);
}

/// Reactive variable configuration.
pub struct VariableConfig;

impl VariableConfig {
    pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);
    /// Upper bound on waiting for a killed listener to be reaped.
    pub const LISTEN_REAP_TIMEOUT: Duration = Duration::from_secs(1);
}
