//! In-process and proxied entity implementations.
//!
//! [`LocalEntity`] owns a handler chain and is the object-style surface of
//! the protocol; sessions provide the callback-style surface over the same
//! contract. [`RemoteEntity`] forwards deliveries over a pluggable
//! [`Transport`].

use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::Mutex;

use regennexus_core::{
    Entity, Error, Message, MessageHandler, Transport, Wire, validate_entity_id,
};

/// An in-process entity owning its handler chain.
///
/// Handlers run in registration order; the first non-empty response
/// terminates the chain. Deliveries to one entity are serialized.
pub struct LocalEntity {
    id: String,
    handlers: RwLock<Vec<Arc<dyn MessageHandler>>>,
    serial: Mutex<()>,
}

impl LocalEntity {
    pub fn new(id: impl Into<String>) -> Result<Self, Error> {
        let id = id.into();
        validate_entity_id(&id)?;
        Ok(Self {
            id,
            handlers: RwLock::new(Vec::new()),
            serial: Mutex::new(()),
        })
    }

    pub fn register_handler(&self, handler: Arc<dyn MessageHandler>) {
        self.handlers.write().push(handler);
    }
}

#[async_trait]
impl Entity for LocalEntity {
    fn id(&self) -> String {
        self.id.clone()
    }

    async fn receive(&self, message: Message) -> Result<Option<Message>, Error> {
        let _serial = self.serial.lock().await;
        let handlers: Vec<Arc<dyn MessageHandler>> = self.handlers.read().clone();

        let mut failure: Option<String> = None;
        for handler in handlers {
            match handler.handle(&message).await {
                Ok(Some(response)) => return Ok(Some(response)),
                Ok(None) => {}
                Err(err) => {
                    log::warn!(entity = self.id.as_str(), intent = message.intent.as_str(), error = err.to_string(); "message handler failed");
                    failure = Some(err.to_string());
                }
            }
        }
        match failure {
            Some(reason) => Err(Error::HandlerFailure {
                intent: message.intent,
                reason,
            }),
            None => Ok(None),
        }
    }
}

/// A proxy for an entity reachable over a transport.
pub struct RemoteEntity {
    id: String,
    transport: Arc<dyn Transport>,
}

impl RemoteEntity {
    pub fn new(id: impl Into<String>, transport: Arc<dyn Transport>) -> Result<Self, Error> {
        let id = id.into();
        validate_entity_id(&id)?;
        Ok(Self { id, transport })
    }
}

#[async_trait]
impl Entity for RemoteEntity {
    fn id(&self) -> String {
        self.id.clone()
    }

    async fn receive(&self, message: Message) -> Result<Option<Message>, Error> {
        let intent = message.intent.clone();
        self.transport
            .send(Wire::Plain(message))
            .await
            .map_err(|err| Error::HandlerFailure {
                intent,
                reason: err.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use regennexus_core::handler_fn;
    use serde_json::json;

    #[tokio::test]
    async fn test_handler_chain_order_and_short_circuit() {
        let entity = LocalEntity::new("bob").unwrap();
        entity.register_handler(handler_fn(|_msg: Message| async move { Ok(None) }));
        entity.register_handler(handler_fn(|msg: Message| async move {
            Ok(Some(Message::response(&msg, "response", json!("first"))))
        }));
        entity.register_handler(handler_fn(|msg: Message| async move {
            Ok(Some(Message::response(&msg, "response", json!("second"))))
        }));

        let request = Message::new("alice", "bob", "query", json!("ping"));
        let response = entity.receive(request).await.unwrap().unwrap();
        assert_eq!(response.payload, json!("first"));
    }

    #[tokio::test]
    async fn test_handler_errors_surface_as_handler_failure() {
        let entity = LocalEntity::new("bob").unwrap();
        entity.register_handler(handler_fn(|_msg: Message| async move {
            Err("boom".into())
        }));

        let request = Message::new("alice", "bob", "query", json!({}));
        let err = entity.receive(request).await.unwrap_err();
        assert!(matches!(err, Error::HandlerFailure { intent, .. } if intent == "query"));

        // a later successful response wins over an earlier failure
        entity.register_handler(handler_fn(|msg: Message| async move {
            Ok(Some(Message::ack_response(&msg)))
        }));
        let request = Message::new("alice", "bob", "query", json!({}));
        assert!(entity.receive(request).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_remote_entity_forwards_over_transport() {
        struct EchoTransport;

        #[async_trait]
        impl Transport for EchoTransport {
            async fn send(
                &self,
                wire: Wire,
            ) -> Result<Option<Message>, regennexus_core::BoxError> {
                match wire {
                    Wire::Plain(message) => {
                        Ok(Some(Message::response(&message, "response", json!("echo"))))
                    }
                    Wire::Sealed(_) => Err("unexpected sealed wire".into()),
                }
            }
        }

        let entity = RemoteEntity::new("camera-1", Arc::new(EchoTransport)).unwrap();
        let request = Message::new("alice", "camera-1", "status.request", json!({}));
        let response = entity.receive(request).await.unwrap().unwrap();
        assert_eq!(response.payload, json!("echo"));
    }
}
