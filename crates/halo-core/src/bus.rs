//! The session bus handle.
//!
//! One `SessionBus` per process is the shared transport connection: the
//! control service, every proxy and discovery all read through it. Cloning
//! is cheap and shares the same registry connection.

use crate::config::RegistryConfig;
use crate::registry::InstanceRegistry;
use crate::Result;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct SessionBus {
    registry: Arc<InstanceRegistry>,
    namespace: Arc<str>,
}

impl SessionBus {
    /// Connect to the bus for the current login session.
    pub fn session() -> Result<Self> {
        Ok(Self::from_registry(InstanceRegistry::open()?))
    }

    /// Connect to a bus backed by a registry at `path`.
    pub fn open_at(path: &Path) -> Result<Self> {
        Ok(Self::from_registry(InstanceRegistry::open_at(path)?))
    }

    pub fn from_registry(registry: InstanceRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
            namespace: Arc::from(RegistryConfig::NAMESPACE),
        }
    }

    /// Use a namespace other than `io.Halo`.
    pub fn with_namespace(mut self, namespace: &str) -> Self {
        self.namespace = Arc::from(namespace);
        self
    }

    pub fn registry(&self) -> &InstanceRegistry {
        &self.registry
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }
}
