//! The message dispatcher.
//!
//! `route` runs the delivery pipeline: validate, decrypt (envelopes),
//! authorize, dispatch, record. Unicast messages resolve to exactly one
//! registered entity and return that entity's first non-empty handler
//! response; broadcasts fan out to every live entity except the sender,
//! logging individual failures and discarding responses.
//!
//! The router never holds a lock across a suspension point a handler can
//! observe: it resolves the recipient's port atomically, then hands off.
//!
//! Messages with the same `context_id` from one sender to one recipient are
//! observed in the order the router accepted them; nothing is guaranteed
//! across contexts or senders.

use futures::future::join_all;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use regennexus_core::{Error, Message, Wire};

use crate::config::SecurityConfig;
use crate::context::ContextStore;
use crate::registry::Registry;
use crate::security::{AccessContext, SecurityManager};

/// Drop and delivery counters. Expired messages are dropped silently, so
/// the counter is the only trace they leave.
#[derive(Debug, Default)]
pub struct RouterStats {
    delivered: AtomicU64,
    expired: AtomicU64,
    denied: AtomicU64,
    decrypt_failures: AtomicU64,
    handler_failures: AtomicU64,
}

impl RouterStats {
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn expired(&self) -> u64 {
        self.expired.load(Ordering::Relaxed)
    }

    pub fn denied(&self) -> u64 {
        self.denied.load(Ordering::Relaxed)
    }

    pub fn decrypt_failures(&self) -> u64 {
        self.decrypt_failures.load(Ordering::Relaxed)
    }

    pub fn handler_failures(&self) -> u64 {
        self.handler_failures.load(Ordering::Relaxed)
    }
}

/// The dispatcher used by sessions and adapters.
pub struct Router {
    registry: Arc<Registry>,
    security: Arc<SecurityManager>,
    contexts: Arc<ContextStore>,
    enforce_policy: bool,
    require_registered_sender: bool,
    stats: RouterStats,
}

impl Router {
    pub fn new(
        registry: Arc<Registry>,
        security: Arc<SecurityManager>,
        contexts: Arc<ContextStore>,
        config: &SecurityConfig,
    ) -> Self {
        Self {
            registry,
            security,
            contexts,
            enforce_policy: config.enforce_policy,
            require_registered_sender: config.require_registered_sender,
            stats: RouterStats::default(),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn security(&self) -> &Arc<SecurityManager> {
        &self.security
    }

    pub fn contexts(&self) -> &Arc<ContextStore> {
        &self.contexts
    }

    pub fn stats(&self) -> &RouterStats {
        &self.stats
    }

    /// Routes one wire form with no deadline.
    pub async fn route(&self, wire: Wire) -> Result<Option<Message>, Error> {
        self.route_with_deadline(wire, None).await
    }

    /// Routes one wire form. Exactly one error is reported per failed call.
    ///
    /// With a deadline set, an undelivered message fails with `Cancelled`;
    /// the target may still receive and process it.
    pub async fn route_with_deadline(
        &self,
        wire: Wire,
        deadline: Option<Duration>,
    ) -> Result<Option<Message>, Error> {
        if self.require_registered_sender {
            let sender = wire.sender();
            if self.registry.lookup(sender).is_none() {
                return Err(Error::UnknownEntity(sender.to_string()));
            }
        }

        // Envelopes open before the policy check so the policy engine sees
        // the true intent; the plaintext path keeps validate -> authorize.
        let message = match &wire {
            Wire::Plain(message) => message.clone(),
            Wire::Sealed(envelope) => {
                let recipient = envelope.recipient.clone();
                self.security
                    .decrypt_message(&recipient, &wire)
                    .inspect_err(|err| {
                        self.stats.decrypt_failures.fetch_add(1, Ordering::Relaxed);
                        log::warn!(sender = envelope.sender.as_str(), id = envelope.id.as_str(), error = err.to_string(); "envelope rejected");
                    })?
            }
        };

        message.validate().inspect_err(|err| {
            if matches!(err, Error::Expired(_)) {
                self.stats.expired.fetch_add(1, Ordering::Relaxed);
                log::debug!(id = message.id.as_str(); "expired message dropped");
            }
        })?;

        if message.is_broadcast() {
            self.broadcast(message).await
        } else {
            self.authorize(&message.sender, &message.recipient, &message.intent)?;
            self.deliver(message, deadline).await
        }
    }

    fn authorize(&self, sender: &str, recipient: &str, intent: &str) -> Result<(), Error> {
        if !self.enforce_policy {
            return Ok(());
        }
        let ctx = AccessContext::default();
        if self.security.policy().evaluate(sender, recipient, intent, &ctx) {
            return Ok(());
        }
        self.stats.denied.fetch_add(1, Ordering::Relaxed);
        Err(Error::PolicyDenied {
            entity: sender.to_string(),
            resource: recipient.to_string(),
            action: intent.to_string(),
        })
    }

    async fn deliver(
        &self,
        message: Message,
        deadline: Option<Duration>,
    ) -> Result<Option<Message>, Error> {
        let port = self.registry.port(&message.recipient)?;

        let result = match deadline {
            Some(deadline) => tokio::time::timeout(deadline, port.receive(message.clone()))
                .await
                .map_err(|_| Error::Cancelled)?,
            None => port.receive(message.clone()).await,
        };

        match result {
            Ok(response) => {
                self.stats.delivered.fetch_add(1, Ordering::Relaxed);
                self.record(&message, response.as_ref());
                Ok(response)
            }
            Err(err) => {
                if matches!(err, Error::HandlerFailure { .. }) {
                    self.stats.handler_failures.fetch_add(1, Ordering::Relaxed);
                }
                Err(err)
            }
        }
    }

    async fn broadcast(&self, message: Message) -> Result<Option<Message>, Error> {
        let targets = self.registry.live_ports_except(&message.sender);
        let admitted: Vec<_> = targets
            .into_iter()
            .filter(|(id, _)| {
                self.authorize(&message.sender, id, &message.intent)
                    .inspect_err(|_| {
                        log::debug!(sender = message.sender.as_str(), recipient = id.as_str(); "broadcast recipient denied by policy");
                    })
                    .is_ok()
            })
            .collect();

        let deliveries = admitted.into_iter().map(|(id, port)| {
            let mut copy = message.clone();
            copy.recipient = id.clone();
            async move {
                if let Err(err) = port.receive(copy).await {
                    log::warn!(recipient = id.as_str(), error = err.to_string(); "broadcast delivery failed");
                }
            }
        });
        join_all(deliveries).await;

        self.stats.delivered.fetch_add(1, Ordering::Relaxed);
        self.record(&message, None);
        Ok(None)
    }

    fn record(&self, message: &Message, response: Option<&Message>) {
        if message.context_id.is_empty() {
            return;
        }
        self.contexts.add_message(&message.context_id, message);
        if let Some(response) = response {
            self.contexts.add_message(&message.context_id, response);
        }
    }
}
