//! Halo Core - instance control bus and reactive variables for shell processes.
//!
//! Long-running instances claim a unique name on the session bus and expose
//! four remote operations. Short-lived clients discover them by name and
//! invoke one operation per connection. Inside each instance, [`Variable`]
//! cells keep state in step with timers and streaming subprocesses.
//!
//! # Example
//!
//! ```rust,ignore
//! use halo_core::{control, discovery, SessionBus};
//!
//! #[tokio::main]
//! async fn main() -> halo_core::Result<()> {
//!     let bus = SessionBus::session()?;
//!
//!     for name in discovery::instance_names(&bus)? {
//!         println!("{}", name);
//!     }
//!
//!     let reply = control::send_request(&bus, "bar", ["ping"]).await?;
//!     println!("{}", reply);
//!
//!     Ok(())
//! }
//! ```

pub mod bus;
pub mod config;
pub mod control;
pub mod discovery;
pub mod error;
pub mod exec;
pub mod identity;
pub mod instance;
pub mod platform;
pub mod registry;
pub mod variable;

// Re-export commonly used types
pub use bus::SessionBus;
pub use config::{ControlConfig, RegistryConfig, VariableConfig};
pub use control::{ControlHandler, ControlOp, ControlRequest, ControlResponse, Proxy, ProxyState};
pub use discovery::{discover, instance_names};
pub use error::{HaloError, Result};
pub use exec::{exec_async, spawn_lines};
pub use identity::InstanceIdentity;
pub use instance::Instance;
pub use registry::{InstanceEntry, InstanceRegistry};
pub use variable::{Notification, ProducerKind, SubscriptionId, Variable, VariableBuilder};
