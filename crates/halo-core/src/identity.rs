//! Instance naming.
//!
//! Every instance is addressed as `<namespace>.<name>`. Clients derive the
//! bus id from the name alone, so the mapping must stay deterministic.

use crate::config::RegistryConfig;
use crate::error::{HaloError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Name of a live instance plus the bus id it is reachable under.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceIdentity {
    name: String,
    bus_id: String,
}

impl InstanceIdentity {
    /// Build the identity for `name` under the default namespace.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        Self::with_namespace(RegistryConfig::NAMESPACE, name)
    }

    /// Build the identity for `name` under an explicit namespace.
    pub fn with_namespace(namespace: &str, name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        validate_name(&name)?;
        let bus_id = format!("{}.{}", namespace, name);
        Ok(Self { name, bus_id })
    }

    /// Recover the identity from a bus id, if it lives under `namespace`.
    pub fn from_bus_id(namespace: &str, bus_id: &str) -> Option<Self> {
        let name = bus_id.strip_prefix(namespace)?.strip_prefix('.')?;
        validate_name(name).ok()?;
        Some(Self {
            name: name.to_string(),
            bus_id: bus_id.to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bus_id(&self) -> &str {
        &self.bus_id
    }
}

impl fmt::Display for InstanceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Instance names are operator supplied; keep them to a shell-safe alphabet.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(HaloError::Validation {
            field: "instance_name".to_string(),
            message: "instance name must not be empty".to_string(),
        });
    }
    if name.len() > RegistryConfig::MAX_NAME_LEN {
        return Err(HaloError::Validation {
            field: "instance_name".to_string(),
            message: format!(
                "instance name is {} bytes, maximum is {}",
                name.len(),
                RegistryConfig::MAX_NAME_LEN
            ),
        });
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
    {
        return Err(HaloError::Validation {
            field: "instance_name".to_string(),
            message: format!("invalid character {:?} in instance name {:?}", bad, name),
        });
    }
    Ok(())
}
