//! The per-entity client session.
//!
//! A session ties the core together for one entity: it connects to the
//! registry, owns the bounded receive queue and the processing task that
//! drains it, stamps and optionally seals outgoing messages, and exposes
//! discovery and heartbeat.
//!
//! # State machine
//! `Init -> Connected -> Disconnecting -> Closed`, one-way. Any operation
//! other than `connect` in `Init` fails with `NotConnected`; sends during
//! or after shutdown fail with `Shutdown`.
//!
//! # Delivery
//! Incoming messages are processed serially, in arrival order, by the
//! handler chain in registration order. Each handler invocation runs in its
//! own task so a panicking handler is logged and isolated instead of
//! tearing down the session.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use regennexus_core::{
    Entity, EntityInfo, EntityKind, Error, Json, Message, MessageHandler, Wire, unix_seconds,
    validate_entity_id,
};

use crate::config::SessionConfig;
use crate::router::Router;

/// Handle for unregistering a message handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Init,
    Connected,
    Disconnecting,
    Closed,
}

/// Per-session options.
#[derive(Clone)]
pub struct SessionOptions {
    pub kind: EntityKind,
    pub capabilities: Vec<String>,
    pub metadata: BTreeMap<String, Json>,
    /// Seal non-broadcast messages end to end.
    pub security_enabled: bool,
    /// Bounded receive queue depth.
    pub queue_capacity: usize,
    /// Bearer token presented at connect time; validated against the
    /// deployment's token service when set.
    pub auth_token: Option<String>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::from_config(&SessionConfig::default())
    }
}

impl SessionOptions {
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            kind: EntityKind::Client,
            capabilities: Vec::new(),
            metadata: BTreeMap::new(),
            security_enabled: config.security_enabled,
            queue_capacity: config.queue_capacity,
            auth_token: None,
        }
    }

    pub fn with_kind(mut self, kind: EntityKind) -> Self {
        self.kind = kind;
        self
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

    pub fn with_security(mut self, security_enabled: bool) -> Self {
        self.security_enabled = security_enabled;
        self
    }

    pub fn with_auth_token(mut self, auth_token: impl Into<String>) -> Self {
        self.auth_token = Some(auth_token.into());
        self
    }
}

struct Delivery {
    message: Message,
    reply: oneshot::Sender<Result<Option<Message>, Error>>,
}

type HandlerChain = Arc<RwLock<Vec<(u64, Arc<dyn MessageHandler>)>>>;

/// A connected entity's handle on the protocol.
pub struct Session {
    entity_id: String,
    router: Arc<Router>,
    options: SessionOptions,
    state: Mutex<SessionState>,
    handlers: HandlerChain,
    next_handler_id: AtomicU64,
    queue: Mutex<Option<mpsc::Sender<Delivery>>>,
    processing: Mutex<Option<JoinHandle<()>>>,
    cancellation_token: CancellationToken,
}

impl Session {
    pub fn new(
        entity_id: impl Into<String>,
        router: Arc<Router>,
        options: SessionOptions,
    ) -> Result<Self, Error> {
        let entity_id = entity_id.into();
        validate_entity_id(&entity_id)?;
        Ok(Self {
            entity_id,
            router,
            options,
            state: Mutex::new(SessionState::Init),
            handlers: Arc::new(RwLock::new(Vec::new())),
            next_handler_id: AtomicU64::new(1),
            queue: Mutex::new(None),
            processing: Mutex::new(None),
            cancellation_token: CancellationToken::new(),
        })
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    /// Cancellation signal handlers should check cooperatively.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.child_token()
    }

    /// Connects the session: validates the auth token, prepares key
    /// material, registers the entity and starts the processing task.
    pub async fn connect(&self) -> Result<(), Error> {
        {
            let state = self.state.lock();
            match *state {
                SessionState::Init => {}
                SessionState::Connected => {
                    return Err(Error::AlreadyRegistered(self.entity_id.clone()));
                }
                _ => return Err(Error::Shutdown(self.entity_id.clone())),
            }
        }

        let security = self.router.security();
        if let Some(token) = &self.options.auth_token {
            let token = security.tokens().validate(token)?;
            if token.entity_id != self.entity_id {
                log::warn!(entity = self.entity_id.as_str(), token_entity = token.entity_id.as_str(); "token entity mismatch");
                return Err(Error::AuthenticationFailed(self.entity_id.clone()));
            }
        }

        let mut info = EntityInfo::new(self.entity_id.clone(), self.options.kind.clone())
            .with_capabilities(self.options.capabilities.iter().cloned());
        info.metadata.extend(self.options.metadata.clone());

        if self.options.security_enabled {
            if !security.crypto().has_public_key(&self.entity_id) {
                security.crypto().generate_keypair(&self.entity_id)?;
            }
            info.public_key = Some(security.crypto().public_key_der(&self.entity_id)?.into());
        }

        let (tx, rx) = mpsc::channel::<Delivery>(self.options.queue_capacity.max(1));
        let port = Arc::new(SessionPort {
            entity_id: self.entity_id.clone(),
            queue: tx.clone(),
        });
        self.router.registry().register(info, port)?;

        let task = tokio::spawn(process_deliveries(
            self.entity_id.clone(),
            rx,
            self.handlers.clone(),
        ));

        *self.queue.lock() = Some(tx);
        *self.processing.lock() = Some(task);
        *self.state.lock() = SessionState::Connected;
        log::info!(entity = self.entity_id.as_str(); "session connected");
        Ok(())
    }

    /// Disconnects: stops accepting deliveries, drains the queue, lets
    /// in-flight handler invocations complete, and unregisters the entity.
    pub async fn disconnect(&self) -> Result<(), Error> {
        {
            let mut state = self.state.lock();
            match *state {
                SessionState::Connected => *state = SessionState::Disconnecting,
                SessionState::Init => return Err(Error::NotConnected(self.entity_id.clone())),
                _ => return Ok(()),
            }
        }
        self.cancellation_token.cancel();

        // unregister first: the directory holds a queue sender through the
        // session port, and the processing task only exits once every
        // sender is gone
        if let Err(err) = self.router.registry().unregister(&self.entity_id) {
            log::warn!(entity = self.entity_id.as_str(), error = err.to_string(); "unregister on disconnect failed");
        }

        let task = {
            *self.queue.lock() = None;
            self.processing.lock().take()
        };
        if let Some(task) = task {
            // drains queued deliveries and lets in-flight handlers finish
            if let Err(err) = task.await {
                log::warn!(entity = self.entity_id.as_str(), error = err.to_string(); "processing task ended abnormally");
            }
        }
        *self.state.lock() = SessionState::Closed;
        log::info!(entity = self.entity_id.as_str(); "session disconnected");
        Ok(())
    }

    /// Registers a message handler at the end of the chain.
    pub fn register_message_handler(&self, handler: Arc<dyn MessageHandler>) -> HandlerId {
        let id = self.next_handler_id.fetch_add(1, Ordering::Relaxed);
        self.handlers.write().push((id, handler));
        HandlerId(id)
    }

    /// Removes a handler; returns whether it was registered.
    pub fn unregister_message_handler(&self, handler_id: HandlerId) -> bool {
        let mut handlers = self.handlers.write();
        let before = handlers.len();
        handlers.retain(|(id, _)| *id != handler_id.0);
        handlers.len() != before
    }

    /// Sends a message with no deadline.
    pub async fn send(&self, message: Message) -> Result<Option<Message>, Error> {
        self.send_with_deadline(message, None).await
    }

    /// Stamps, optionally seals, and routes a message. Returns the
    /// recipient's response, if its handler chain produced one.
    pub async fn send_with_deadline(
        &self,
        mut message: Message,
        deadline: Option<Duration>,
    ) -> Result<Option<Message>, Error> {
        match *self.state.lock() {
            SessionState::Connected => {}
            SessionState::Init => return Err(Error::NotConnected(self.entity_id.clone())),
            _ => return Err(Error::Shutdown(self.entity_id.clone())),
        }

        // the session owns the sender identity
        if message.sender.is_empty() {
            message.sender = self.entity_id.clone();
        } else if message.sender != self.entity_id {
            return Err(Error::InvalidMessage(format!(
                "sender {:?} does not match session entity {:?}",
                message.sender, self.entity_id
            )));
        }
        if message.id.is_empty() {
            message.id = xid::new().to_string();
        }
        if message.timestamp == 0 {
            message.timestamp = unix_seconds();
        }
        if message.context_id.is_empty() {
            message.context_id = xid::new().to_string();
        }

        let wire = if self.options.security_enabled && !message.is_broadcast() {
            let envelope =
                self.router
                    .security()
                    .encrypt_message(&self.entity_id, &message.recipient, &message)?;
            Wire::Sealed(envelope)
        } else {
            Wire::Plain(message)
        };

        self.router.route_with_deadline(wire, deadline).await
    }

    /// Advertises capabilities (and optional metadata) in the directory.
    pub fn register_capabilities(
        &self,
        capabilities: Vec<String>,
        metadata: Vec<(String, Json)>,
    ) -> Result<(), Error> {
        self.ensure_connected()?;
        self.router
            .registry()
            .update_entity(&self.entity_id, capabilities, metadata)
    }

    /// Finds live entities by kind and/or capabilities.
    pub fn find_entities(
        &self,
        kind: Option<&EntityKind>,
        capabilities: Option<&[&str]>,
    ) -> Result<Vec<EntityInfo>, Error> {
        self.ensure_connected()?;
        Ok(self.router.registry().find(kind, capabilities))
    }

    /// Refreshes this entity's liveness in the directory.
    pub fn heartbeat(&self) -> Result<(), Error> {
        self.ensure_connected()?;
        self.router.registry().heartbeat(&self.entity_id)
    }

    fn ensure_connected(&self) -> Result<(), Error> {
        match *self.state.lock() {
            SessionState::Connected => Ok(()),
            SessionState::Init => Err(Error::NotConnected(self.entity_id.clone())),
            _ => Err(Error::Shutdown(self.entity_id.clone())),
        }
    }
}

/// The delivery port a session registers in the directory: enqueues into
/// the bounded queue and waits for the processing task's verdict.
struct SessionPort {
    entity_id: String,
    queue: mpsc::Sender<Delivery>,
}

#[async_trait]
impl Entity for SessionPort {
    fn id(&self) -> String {
        self.entity_id.clone()
    }

    async fn receive(&self, message: Message) -> Result<Option<Message>, Error> {
        let (reply, verdict) = oneshot::channel();
        self.queue
            .try_send(Delivery { message, reply })
            .map_err(|err| match err {
                mpsc::error::TrySendError::Full(_) => Error::Backpressure(self.entity_id.clone()),
                mpsc::error::TrySendError::Closed(_) => Error::Shutdown(self.entity_id.clone()),
            })?;
        verdict
            .await
            .map_err(|_| Error::Shutdown(self.entity_id.clone()))?
    }
}

/// Drains the receive queue, invoking the handler chain serially per
/// delivery. Exits when every queue sender is gone.
async fn process_deliveries(entity_id: String, mut rx: mpsc::Receiver<Delivery>, handlers: HandlerChain) {
    while let Some(delivery) = rx.recv().await {
        let chain: Vec<(u64, Arc<dyn MessageHandler>)> = handlers.read().clone();
        let result = invoke_chain(&entity_id, &chain, delivery.message).await;
        // the sender may have stopped waiting; that is not an error here
        let _ = delivery.reply.send(result);
    }
    log::debug!(entity = entity_id.as_str(); "processing task drained");
}

async fn invoke_chain(
    entity_id: &str,
    chain: &[(u64, Arc<dyn MessageHandler>)],
    message: Message,
) -> Result<Option<Message>, Error> {
    let mut failure: Option<String> = None;
    for (_, handler) in chain {
        let handler = handler.clone();
        let msg = message.clone();
        // a panicking handler must not tear down the session
        let invocation = tokio::spawn(async move { handler.handle(&msg).await });
        match invocation.await {
            Ok(Ok(Some(response))) => return Ok(Some(response)),
            Ok(Ok(None)) => {}
            Ok(Err(err)) => {
                log::warn!(entity = entity_id, intent = message.intent.as_str(), error = err.to_string(); "message handler failed");
                failure = Some(err.to_string());
            }
            Err(err) if err.is_panic() => {
                log::error!(entity = entity_id, intent = message.intent.as_str(); "message handler panicked");
                failure = Some("handler panicked".to_string());
            }
            Err(_) => {
                failure = Some("handler cancelled".to_string());
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RegistryConfig, SecurityConfig};
    use crate::context::ContextStore;
    use crate::registry::Registry;
    use crate::security::SecurityManager;
    use regennexus_core::handler_fn;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn router() -> Arc<Router> {
        let security_config = SecurityConfig::default();
        Arc::new(Router::new(
            Arc::new(Registry::new(RegistryConfig::default())),
            Arc::new(SecurityManager::new(security_config.clone())),
            Arc::new(ContextStore::default()),
            &security_config,
        ))
    }

    fn plain_options() -> SessionOptions {
        SessionOptions::default().with_security(false)
    }

    async fn pong_session(router: &Arc<Router>, id: &str, secure: bool) -> Session {
        let options = SessionOptions::default().with_security(secure);
        let session = Session::new(id, router.clone(), options).unwrap();
        session.connect().await.unwrap();
        session.register_message_handler(handler_fn(|msg: Message| async move {
            if msg.intent == "query" {
                Ok(Some(Message::response(&msg, "response", json!("pong"))))
            } else {
                Ok(None)
            }
        }));
        session
    }

    #[tokio::test]
    async fn test_request_response_plaintext() {
        let router = router();
        let alice = Session::new("alice", router.clone(), plain_options()).unwrap();
        alice.connect().await.unwrap();
        let bob = pong_session(&router, "bob", false).await;

        let request = Message::new("alice", "bob", "query", json!("ping"));
        let context_id = request.context_id.clone();
        let response = alice.send(request).await.unwrap().unwrap();
        assert_eq!(response.intent, "response");
        assert_eq!(response.payload, json!("pong"));

        let context = router.contexts().get_context(&context_id).unwrap();
        let intents: Vec<&str> = context.messages().map(|m| m.intent.as_str()).collect();
        assert_eq!(intents, ["query", "response"]);

        alice.disconnect().await.unwrap();
        bob.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_request_response_encrypted() {
        let router = router();
        let alice = Session::new("alice", router.clone(), SessionOptions::default()).unwrap();
        alice.connect().await.unwrap();
        let bob = pong_session(&router, "bob", true).await;

        let request = Message::new("alice", "bob", "query", json!("ping"));
        let response = alice.send(request).await.unwrap().unwrap();
        assert_eq!(response.payload, json!("pong"));

        alice.disconnect().await.unwrap();
        bob.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_state_machine_is_one_way() {
        let router = router();
        let session = Session::new("alice", router.clone(), plain_options()).unwrap();

        // Init: everything but connect fails with NotConnected
        let message = Message::new("", "bob", "query", json!({}));
        assert!(matches!(
            session.send(message.clone()).await,
            Err(Error::NotConnected(_))
        ));
        assert!(matches!(session.heartbeat(), Err(Error::NotConnected(_))));
        assert!(matches!(
            session.disconnect().await,
            Err(Error::NotConnected(_))
        ));

        session.connect().await.unwrap();
        assert!(matches!(
            session.connect().await,
            Err(Error::AlreadyRegistered(_))
        ));

        session.disconnect().await.unwrap();
        assert!(matches!(session.send(message).await, Err(Error::Shutdown(_))));
        // transitions are one-way: no reconnect
        assert!(matches!(session.connect().await, Err(Error::Shutdown(_))));
        // a second disconnect is a no-op
        session.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_sender_is_stamped_and_enforced() {
        let router = router();
        let alice = Session::new("alice", router.clone(), plain_options()).unwrap();
        alice.connect().await.unwrap();
        let bob = pong_session(&router, "bob", false).await;

        // empty sender is stamped with the session entity
        let unstamped = Message {
            sender: String::new(),
            ..Message::new("x", "bob", "query", json!("ping"))
        };
        let response = alice.send(unstamped).await.unwrap().unwrap();
        assert_eq!(response.recipient, "alice");

        // a forged sender is rejected before enqueue
        let forged = Message::new("mallory", "bob", "query", json!({}));
        assert!(matches!(
            alice.send(forged).await,
            Err(Error::InvalidMessage(_))
        ));

        alice.disconnect().await.unwrap();
        bob.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_revoked_token_fails_authentication() {
        let router = router();
        router.security().ca().bootstrap().unwrap();
        let token = router
            .security()
            .tokens()
            .issue("svc", 24, BTreeMap::new())
            .unwrap();

        // valid token connects
        let options = plain_options().with_auth_token(token.clone());
        let session = Session::new("svc", router.clone(), options.clone()).unwrap();
        session.connect().await.unwrap();
        session.disconnect().await.unwrap();

        // revoked token does not, even inside its validity window
        let parsed = router.security().tokens().validate(&token).unwrap();
        router.security().tokens().revoke(&parsed.token_id);
        let session = Session::new("svc", router.clone(), options).unwrap();
        assert!(matches!(
            session.connect().await,
            Err(Error::AuthenticationFailed(_))
        ));
        assert!(router.registry().lookup("svc").is_none());
    }

    #[tokio::test]
    async fn test_token_for_other_entity_is_rejected() {
        let router = router();
        router.security().ca().bootstrap().unwrap();
        let token = router
            .security()
            .tokens()
            .issue("someone-else", 24, BTreeMap::new())
            .unwrap();

        let session =
            Session::new("svc", router.clone(), plain_options().with_auth_token(token)).unwrap();
        assert!(matches!(
            session.connect().await,
            Err(Error::AuthenticationFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_backpressure_on_full_queue() {
        let router = router();
        let alice = Session::new("alice", router.clone(), plain_options()).unwrap();
        alice.connect().await.unwrap();

        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        let mut options = plain_options();
        options.queue_capacity = 1;
        let bob = Session::new("bob", router.clone(), options).unwrap();
        bob.connect().await.unwrap();
        let handler_gate = gate.clone();
        bob.register_message_handler(handler_fn(move |_msg: Message| {
            let gate = handler_gate.clone();
            async move {
                let _permit = gate.acquire().await?;
                Ok(None)
            }
        }));

        // first message occupies the handler, second fills the queue
        let r = router.clone();
        let first = tokio::spawn({
            let r = r.clone();
            async move {
                r.route(Wire::Plain(Message::new("alice", "bob", "work", json!(1))))
                    .await
            }
        });
        let second = tokio::spawn({
            let r = r.clone();
            async move {
                r.route(Wire::Plain(Message::new("alice", "bob", "work", json!(2))))
                    .await
            }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let third = alice
            .send(Message::new("alice", "bob", "work", json!(3)))
            .await;
        assert!(matches!(third, Err(Error::Backpressure(_))));

        gate.add_permits(16);
        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();

        alice.disconnect().await.unwrap();
        bob.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_panicking_handler_does_not_kill_session() {
        let router = router();
        let alice = Session::new("alice", router.clone(), plain_options()).unwrap();
        alice.connect().await.unwrap();

        let bob = Session::new("bob", router.clone(), plain_options()).unwrap();
        bob.connect().await.unwrap();
        let panicking = bob.register_message_handler(handler_fn(|_msg: Message| async move {
            panic!("handler bug");
            #[allow(unreachable_code)]
            Ok(None)
        }));

        let result = alice.send(Message::new("alice", "bob", "query", json!({}))).await;
        assert!(matches!(result, Err(Error::HandlerFailure { .. })));

        // the session survives and keeps processing
        assert!(bob.unregister_message_handler(panicking));
        bob.register_message_handler(handler_fn(|msg: Message| async move {
            Ok(Some(Message::ack_response(&msg)))
        }));
        let response = alice
            .send(Message::new("alice", "bob", "query", json!({})))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response.intent, "ack");

        alice.disconnect().await.unwrap();
        bob.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_capabilities_discovery_and_heartbeat() {
        let router = router();
        let sensor = Session::new(
            "temp_sensor",
            router.clone(),
            plain_options().with_kind(EntityKind::Device),
        )
        .unwrap();
        sensor.connect().await.unwrap();
        sensor
            .register_capabilities(
                vec!["sensor.temperature".to_string()],
                vec![("update_frequency".to_string(), json!(5))],
            )
            .unwrap();
        sensor.heartbeat().unwrap();

        let found = sensor
            .find_entities(Some(&EntityKind::Device), Some(&["sensor.temperature"]))
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "temp_sensor");

        sensor.disconnect().await.unwrap();
        assert!(router.registry().lookup("temp_sensor").is_none());
    }
}
