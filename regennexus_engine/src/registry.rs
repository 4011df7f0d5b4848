//! The entity directory.
//!
//! The registry maps entity IDs to their directory records and delivery
//! ports, answers discovery queries, and tracks liveness through
//! heartbeats. An entity with no recent heartbeat is stale: discovery skips
//! it, lookups mark it, and routing to it fails with `UnknownEntity`.
//!
//! Staleness is computed on read against the effective threshold
//! (3x the entity's declared `update_frequency`, falling back to the
//! configured default); the background sweeper only persists the flag and
//! logs transitions.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use regennexus_core::{
    Entity, EntityInfo, EntityKind, Error, Json, unix_seconds, validate_entity_id,
};

use crate::config::RegistryConfig;

/// A directory record as returned by [`Registry::lookup`].
#[derive(Debug, Clone)]
pub struct EntitySnapshot {
    pub info: EntityInfo,
    pub stale: bool,
}

struct Registered {
    info: RwLock<EntityInfo>,
    port: Arc<dyn Entity>,
    stale: AtomicBool,
}

impl Registered {
    fn is_stale(&self, default_threshold: u64) -> bool {
        if self.stale.load(Ordering::Relaxed) {
            return true;
        }
        let info = self.info.read();
        let threshold = info
            .update_frequency()
            .map(|freq| freq.saturating_mul(3))
            .unwrap_or(default_threshold);
        unix_seconds().saturating_sub(info.last_heartbeat) > threshold
    }
}

/// Register/unregister, lookup, discovery and heartbeat liveness.
pub struct Registry {
    entities: RwLock<HashMap<String, Arc<Registered>>>,
    config: RegistryConfig,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

impl Registry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            entities: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Registers an entity under its directory record. Fails with
    /// `AlreadyRegistered` when the ID collides.
    pub fn register(&self, mut info: EntityInfo, port: Arc<dyn Entity>) -> Result<(), Error> {
        validate_entity_id(&info.id)?;
        if port.id() != info.id {
            return Err(Error::InvalidEntityId(format!(
                "port ID {:?} does not match record ID {:?}",
                port.id(),
                info.id
            )));
        }

        let mut entities = self.entities.write();
        if entities.contains_key(&info.id) {
            return Err(Error::AlreadyRegistered(info.id));
        }
        info.last_heartbeat = unix_seconds();
        let id = info.id.clone();
        entities.insert(
            id.clone(),
            Arc::new(Registered {
                info: RwLock::new(info),
                port,
                stale: AtomicBool::new(false),
            }),
        );
        log::info!(entity = id.as_str(); "entity registered");
        Ok(())
    }

    pub fn unregister(&self, entity_id: &str) -> Result<(), Error> {
        match self.entities.write().remove(entity_id) {
            Some(_) => {
                log::info!(entity = entity_id; "entity unregistered");
                Ok(())
            }
            None => Err(Error::UnknownEntity(entity_id.to_string())),
        }
    }

    /// Looks up a directory record; stale entities are returned marked.
    pub fn lookup(&self, entity_id: &str) -> Option<EntitySnapshot> {
        let entities = self.entities.read();
        let registered = entities.get(entity_id)?;
        Some(EntitySnapshot {
            info: registered.info.read().clone(),
            stale: registered.is_stale(self.config.stale_after_secs),
        })
    }

    /// Live entities advertising a capability.
    pub fn find_by_capability(&self, capability: &str) -> Vec<EntityInfo> {
        self.find(None, Some(std::slice::from_ref(&capability)))
    }

    /// Live entities of a kind.
    pub fn find_by_type(&self, kind: &EntityKind) -> Vec<EntityInfo> {
        self.find(Some(kind), None)
    }

    /// Live entities matching an optional kind and all of the given
    /// capabilities.
    pub fn find(&self, kind: Option<&EntityKind>, capabilities: Option<&[&str]>) -> Vec<EntityInfo> {
        let entities = self.entities.read();
        entities
            .values()
            .filter(|registered| !registered.is_stale(self.config.stale_after_secs))
            .filter_map(|registered| {
                let info = registered.info.read();
                if let Some(kind) = kind
                    && &info.kind != kind
                {
                    return None;
                }
                if let Some(capabilities) = capabilities
                    && !capabilities.iter().all(|c| info.has_capability(c))
                {
                    return None;
                }
                Some(info.clone())
            })
            .collect()
    }

    /// Refreshes an entity's liveness.
    pub fn heartbeat(&self, entity_id: &str) -> Result<(), Error> {
        let entities = self.entities.read();
        let registered = entities
            .get(entity_id)
            .ok_or_else(|| Error::UnknownEntity(entity_id.to_string()))?;
        registered.info.write().last_heartbeat = unix_seconds();
        registered.stale.store(false, Ordering::Relaxed);
        Ok(())
    }

    /// Replaces an entity's advertised capabilities and merges metadata.
    pub fn update_entity(
        &self,
        entity_id: &str,
        capabilities: Vec<String>,
        metadata: Vec<(String, Json)>,
    ) -> Result<(), Error> {
        let entities = self.entities.read();
        let registered = entities
            .get(entity_id)
            .ok_or_else(|| Error::UnknownEntity(entity_id.to_string()))?;
        let mut info = registered.info.write();
        info.capabilities = capabilities.into_iter().collect();
        info.metadata.extend(metadata);
        Ok(())
    }

    /// The delivery port for a live entity; stale and unknown entities
    /// both fail with `UnknownEntity`.
    pub(crate) fn port(&self, entity_id: &str) -> Result<Arc<dyn Entity>, Error> {
        let entities = self.entities.read();
        let registered = entities
            .get(entity_id)
            .ok_or_else(|| Error::UnknownEntity(entity_id.to_string()))?;
        if registered.is_stale(self.config.stale_after_secs) {
            return Err(Error::UnknownEntity(entity_id.to_string()));
        }
        Ok(registered.port.clone())
    }

    /// Ports of every live entity except `sender`, for broadcast fan-out.
    pub(crate) fn live_ports_except(&self, sender: &str) -> Vec<(String, Arc<dyn Entity>)> {
        let entities = self.entities.read();
        entities
            .iter()
            .filter(|(id, registered)| {
                id.as_str() != sender && !registered.is_stale(self.config.stale_after_secs)
            })
            .map(|(id, registered)| (id.clone(), registered.port.clone()))
            .collect()
    }

    /// Marks entities past their heartbeat threshold; returns how many
    /// transitioned to stale in this pass.
    pub fn sweep_stale(&self) -> usize {
        let entities = self.entities.read();
        let mut transitioned = 0;
        for (id, registered) in entities.iter() {
            if registered.is_stale(self.config.stale_after_secs)
                && !registered.stale.swap(true, Ordering::Relaxed)
            {
                transitioned += 1;
                log::warn!(entity = id.as_str(); "entity marked stale");
            }
        }
        transitioned
    }

    /// Spawns the background stale sweeper until the token is cancelled.
    pub fn start_sweep(self: &Arc<Self>, token: CancellationToken) {
        let registry = self.clone();
        let interval = Duration::from_secs(self.config.sweep_interval_secs.max(1));
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        registry.sweep_stale();
                    }
                }
            }
        });
    }

    pub fn len(&self) -> usize {
        self.entities.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.read().is_empty()
    }
}
