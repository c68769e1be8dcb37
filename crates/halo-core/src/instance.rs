//! Hosting side of an instance: control service plus claimed name.

use crate::bus::SessionBus;
use crate::control::service::{ControlHandler, ControlService, ControlServiceHandle, ShutdownTrigger};
use crate::identity::InstanceIdentity;
use crate::registry::InstanceEntry;
use crate::Result;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A registered, reachable instance.
///
/// Dropping it releases the name and stops the control service.
pub struct Instance {
    bus: SessionBus,
    identity: InstanceIdentity,
    entry: InstanceEntry,
    service: Option<ControlServiceHandle>,
}

impl Instance {
    /// Start serving `handler` and claim `name` on the bus.
    ///
    /// Fails with `RegistrationConflict` if a live process already holds the
    /// name; the freshly started service is shut down again in that case.
    pub async fn register<H: ControlHandler>(
        bus: &SessionBus,
        name: &str,
        handler: Arc<H>,
    ) -> Result<Self> {
        let identity = InstanceIdentity::with_namespace(bus.namespace(), name)?;

        match bus.registry().cleanup_stale() {
            Ok(0) => {}
            Ok(removed) => debug!("Removed {} stale registration(s)", removed),
            Err(e) => warn!("Stale registration cleanup failed: {}", e),
        }

        let mut service = ControlService::start(handler).await?;

        let entry = match bus
            .registry()
            .claim(&identity, std::process::id(), service.port())
        {
            Ok(entry) => entry,
            Err(e) => {
                service.shutdown();
                return Err(e);
            }
        };

        info!("Instance {} is up on port {}", identity.bus_id(), entry.port);

        Ok(Self {
            bus: bus.clone(),
            identity,
            entry,
            service: Some(service),
        })
    }

    pub fn identity(&self) -> &InstanceIdentity {
        &self.identity
    }

    pub fn entry(&self) -> &InstanceEntry {
        &self.entry
    }

    pub fn port(&self) -> u16 {
        self.entry.port
    }

    pub fn bus(&self) -> &SessionBus {
        &self.bus
    }

    /// Trigger for stopping the control service from inside a handler.
    pub fn shutdown_trigger(&self) -> Option<ShutdownTrigger> {
        self.service.as_ref().map(ControlServiceHandle::shutdown_trigger)
    }

    pub fn is_running(&self) -> bool {
        self.service.is_some()
    }

    /// Release the name, then stop the control service. Idempotent.
    pub fn shutdown(&mut self) {
        let Some(mut service) = self.service.take() else {
            return;
        };

        if let Err(e) = self
            .bus
            .registry()
            .release(&self.identity, self.entry.pid)
        {
            warn!("Failed to release {}: {}", self.identity.bus_id(), e);
        }
        service.shutdown();

        info!("Instance {} shut down", self.identity.bus_id());
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        self.shutdown();
    }
}
