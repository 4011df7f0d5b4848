//! The device adapter contract.
//!
//! Adapters are external components (GPIO, camera, serial, sensor readers)
//! that register one entity per device and consume the core as a client.
//! The core guarantees to deliver only messages addressed to the adapter's
//! entity ID (or broadcasts), to respect its backpressure, and to fan out
//! `event.*` messages to subscribers.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};

use crate::BoxError;
use crate::entity::{EntityInfo, EntityKind};
use crate::json::Json;

/// Static description of the entity an adapter registers.
#[derive(Debug, Clone)]
pub struct AdapterDescriptor {
    pub entity_id: String,
    pub kind: EntityKind,
    pub capabilities: BTreeSet<String>,
    pub metadata: BTreeMap<String, Json>,
}

impl AdapterDescriptor {
    pub fn new(entity_id: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            kind: EntityKind::Device,
            capabilities: BTreeSet::new(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities
            .extend(capabilities.into_iter().map(Into::into));
        self
    }

    pub fn entity_info(&self) -> EntityInfo {
        let mut info = EntityInfo::new(self.entity_id.clone(), self.kind.clone());
        info.capabilities = self.capabilities.clone();
        info.metadata = self.metadata.clone();
        info
    }
}

/// A device-specific plugin. Implementations live outside the core; the
/// engine's adapter runtime turns `command.<name>` intents into
/// [`DeviceAdapter::execute_command`] calls and broadcasts the adapter's
/// events as `event.<type>` messages.
#[async_trait]
pub trait DeviceAdapter: Send + Sync {
    /// The entity this adapter registers.
    fn descriptor(&self) -> AdapterDescriptor;

    /// Called once before the adapter entity is registered.
    async fn initialize(&self) -> Result<(), BoxError> {
        Ok(())
    }

    /// Called once after the adapter entity is unregistered.
    async fn shutdown(&self) -> Result<(), BoxError> {
        Ok(())
    }

    /// Executes a device command. Invoked for `command.<name>` intents that
    /// no registered command handler claimed first.
    async fn execute_command(&self, command: &str, params: Json) -> Result<Json, BoxError>;
}
