//! Entity descriptors and the traits entities are polymorphic over.
//!
//! An entity is a named communication endpoint. The directory stores an
//! [`EntityInfo`] record per entity; delivery goes through the [`Entity`]
//! trait, which unifies the two presentation surfaces of the protocol:
//! an object owning its handler chain, and a session with registered
//! callbacks. Both reduce to "receive a message, optionally produce one
//! response".
//!
//! [`Transport`] is the seam for remote entities; the in-process form is
//! the registry itself and everything else is pluggable.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;

use crate::error::Error;
use crate::json::Json;
use crate::message::{Message, Wire};
use crate::{BoxError, BoxPinFut};

/// Broad classification of an entity. User-defined kinds use [`EntityKind::Other`].
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    #[default]
    Client,
    Device,
    Bridge,
    Service,
    #[serde(untagged)]
    Other(String),
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityKind::Client => write!(f, "client"),
            EntityKind::Device => write!(f, "device"),
            EntityKind::Bridge => write!(f, "bridge"),
            EntityKind::Service => write!(f, "service"),
            EntityKind::Other(kind) => write!(f, "{kind}"),
        }
    }
}

/// Directory record for a registered entity.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct EntityInfo {
    /// Unique, immutable entity ID.
    pub id: String,
    #[serde(rename = "type", default)]
    pub kind: EntityKind,
    /// Dotted capability strings this entity advertises.
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    /// Freeform metadata. The key `update_frequency` (seconds) declares the
    /// entity's heartbeat cadence and drives the stale threshold.
    #[serde(default)]
    pub metadata: BTreeMap<String, Json>,
    /// DER (SPKI) public key, when the entity participates in security.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<ByteBuf>,
    /// Unix seconds of the last observed heartbeat.
    #[serde(default)]
    pub last_heartbeat: u64,
}

impl EntityInfo {
    pub fn new(id: impl Into<String>, kind: EntityKind) -> Self {
        Self {
            id: id.into(),
            kind,
            capabilities: BTreeSet::new(),
            metadata: BTreeMap::new(),
            public_key: None,
            last_heartbeat: crate::unix_seconds(),
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

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }

    /// Declared heartbeat cadence in seconds, if any.
    pub fn update_frequency(&self) -> Option<u64> {
        self.metadata.get("update_frequency").and_then(Json::as_u64)
    }
}

/// A synchronous message handler: receives a message and optionally
/// produces one response. The first handler in a chain that returns a
/// non-empty response terminates the chain.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &Message) -> Result<Option<Message>, BoxError>;
}

/// Adapter turning an async closure into a [`MessageHandler`].
pub struct FnHandler {
    #[allow(clippy::type_complexity)]
    f: Box<dyn Fn(Message) -> BoxPinFut<Result<Option<Message>, BoxError>> + Send + Sync>,
}

/// Wraps an async closure as a boxed [`MessageHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<Message>, BoxError>> + Send + 'static,
{
    Arc::new(FnHandler {
        f: Box::new(move |message| Box::pin(f(message))),
    })
}

#[async_trait]
impl MessageHandler for FnHandler {
    async fn handle(&self, message: &Message) -> Result<Option<Message>, BoxError> {
        (self.f)(message.clone()).await
    }
}

/// The delivery seam every registered entity implements.
///
/// Within one entity, deliveries are processed serially; implementations
/// must not interleave two `receive` calls on the same entity.
#[async_trait]
pub trait Entity: Send + Sync {
    /// The entity's unique ID.
    fn id(&self) -> String;

    /// Delivers one message and waits for the handler chain to settle.
    /// Returns the first non-empty response, if any.
    async fn receive(&self, message: Message) -> Result<Option<Message>, Error>;
}

/// Outbound leg for entities that live behind a transport. The in-process
/// registry is the `"local"` transport; TCP/WebSocket forms plug in here.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, wire: Wire) -> Result<Option<Message>, BoxError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_entity_kind_serde() {
        assert_eq!(
            serde_json::to_string(&EntityKind::Device).unwrap(),
            r#""device""#
        );
        let kind: EntityKind = serde_json::from_str(r#""robot""#).unwrap();
        assert_eq!(kind, EntityKind::Other("robot".to_string()));
    }

    #[test]
    fn test_entity_info_metadata() {
        let mut info = EntityInfo::new("temp_sensor", EntityKind::Device)
            .with_capabilities(["sensor.temperature"]);
        assert!(info.has_capability("sensor.temperature"));
        assert!(!info.has_capability("sensor.humidity"));
        assert_eq!(info.update_frequency(), None);

        info.metadata
            .insert("update_frequency".to_string(), json!(5));
        assert_eq!(info.update_frequency(), Some(5));
    }

    #[tokio::test]
    async fn test_handler_fn() {
        let handler = handler_fn(|message: Message| async move {
            if message.intent == "query" {
                Ok(Some(Message::response(&message, "response", json!("pong"))))
            } else {
                Ok(None)
            }
        });

        let request = Message::new("alice", "bob", "query", json!("ping"));
        let response = handler.handle(&request).await.unwrap().unwrap();
        assert_eq!(response.payload, json!("pong"));

        let other = Message::new("alice", "bob", "notify", json!({}));
        assert!(handler.handle(&other).await.unwrap().is_none());
    }
}
