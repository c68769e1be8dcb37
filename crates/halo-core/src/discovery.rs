//! Enumerating live instances.

use crate::bus::SessionBus;
use crate::identity::InstanceIdentity;
use crate::{HaloError, Result};
use std::collections::BTreeSet;
use tracing::debug;

/// List every live instance registered under the bus namespace.
///
/// The namespace prefix is stripped from each bus id to recover the name.
/// Any failure to read the registry surfaces as `DiscoveryFailed`; there is
/// no retry.
pub fn discover(bus: &SessionBus) -> Result<BTreeSet<InstanceIdentity>> {
    let entries = bus
        .registry()
        .list_live(bus.namespace())
        .map_err(|e| HaloError::DiscoveryFailed {
            message: e.to_string(),
        })?;

    let instances: BTreeSet<InstanceIdentity> = entries
        .iter()
        .filter_map(|entry| InstanceIdentity::from_bus_id(bus.namespace(), &entry.bus_id))
        .collect();

    debug!("Discovered {} live instance(s)", instances.len());
    Ok(instances)
}

/// Names of every live instance, sorted.
pub fn instance_names(bus: &SessionBus) -> Result<Vec<String>> {
    Ok(discover(bus)?
        .into_iter()
        .map(|id| id.name().to_string())
        .collect())
}
