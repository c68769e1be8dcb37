//! The control bus between CLI invocations and running instances.
//!
//! - `protocol` - operation names, JSON-RPC envelopes and frame I/O
//! - `service` - the per-instance listener and the `ControlHandler` seam
//! - `proxy` - single-call client handles and one-shot helpers

pub mod protocol;
pub mod proxy;
pub mod service;

pub use protocol::{ControlOp, ControlRequest, ControlResponse};
pub use proxy::{open_inspector, quit_instance, send_request, toggle_window, Proxy, ProxyState};
pub use service::{dispatch, ControlHandler, ControlService, ControlServiceHandle, ShutdownTrigger};
