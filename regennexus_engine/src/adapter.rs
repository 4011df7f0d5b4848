//! Runtime glue between a [`DeviceAdapter`] and the protocol.
//!
//! The runtime registers one entity per adapter, translates `command.*`
//! intents into command-handler or adapter calls, replies with a response
//! or an `error` response, and broadcasts the adapter's events as
//! `event.<type>` messages.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use regennexus_core::{
    BoxError, BoxPinFut, DeviceAdapter, Error, Json, Message, handler_fn, intents,
};

use crate::config::SessionConfig;
use crate::router::Router;
use crate::session::{Session, SessionOptions};

type CommandFn = Arc<dyn Fn(Json) -> BoxPinFut<Result<Json, BoxError>> + Send + Sync>;

/// Hosts one device adapter as a protocol entity.
pub struct AdapterRuntime {
    adapter: Arc<dyn DeviceAdapter>,
    session: Arc<Session>,
    command_handlers: Arc<RwLock<HashMap<String, CommandFn>>>,
}

impl AdapterRuntime {
    pub fn new(
        adapter: Arc<dyn DeviceAdapter>,
        router: Arc<Router>,
        config: &SessionConfig,
    ) -> Result<Self, Error> {
        let descriptor = adapter.descriptor();
        let mut options = SessionOptions::from_config(config)
            .with_kind(descriptor.kind.clone())
            .with_capabilities(descriptor.capabilities.iter().cloned());
        options.metadata.extend(descriptor.metadata.clone());

        let session = Arc::new(Session::new(descriptor.entity_id, router, options)?);
        Ok(Self {
            adapter,
            session,
            command_handlers: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Registers a handler for one command name. A registered handler is
    /// consulted before the adapter's own `execute_command`.
    pub fn register_command_handler<F, Fut>(&self, command: &str, f: F)
    where
        F: Fn(Json) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Json, BoxError>> + Send + 'static,
    {
        self.command_handlers.write().insert(
            command.to_string(),
            Arc::new(move |params| Box::pin(f(params))),
        );
    }

    /// Initializes the adapter, connects its entity, and installs the
    /// command dispatcher.
    pub async fn start(&self) -> Result<(), BoxError> {
        self.adapter.initialize().await?;
        self.session.connect().await?;

        let adapter = self.adapter.clone();
        let command_handlers = self.command_handlers.clone();
        self.session
            .register_message_handler(handler_fn(move |message: Message| {
                let adapter = adapter.clone();
                let command_handlers = command_handlers.clone();
                async move {
                    let Some(command) = message.intent.strip_prefix(intents::COMMAND_PREFIX) else {
                        return Ok(None);
                    };
                    let registered = command_handlers.read().get(command).cloned();
                    let result = match registered {
                        Some(handler) => handler(message.payload.clone()).await,
                        None => adapter.execute_command(command, message.payload.clone()).await,
                    };
                    match result {
                        Ok(value) => Ok(Some(Message::response(&message, "response", value))),
                        Err(err) => {
                            log::warn!(command = command, error = err.to_string(); "command failed");
                            Ok(Some(Message::error_response(
                                &message,
                                "command_failed",
                                err.to_string(),
                            )))
                        }
                    }
                }
            }));
        Ok(())
    }

    /// Broadcasts an `event.<type>` message from the adapter entity.
    pub async fn emit_event(&self, event_type: &str, data: Json) -> Result<(), Error> {
        let message = Message::new(
            self.session.entity_id(),
            regennexus_core::BROADCAST_RECIPIENT,
            format!("{}{event_type}", intents::EVENT_PREFIX),
            data,
        );
        self.session.send(message).await?;
        Ok(())
    }

    /// Disconnects the adapter entity and shuts the adapter down.
    pub async fn stop(&self) -> Result<(), BoxError> {
        self.session.disconnect().await?;
        self.adapter.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RegistryConfig, SecurityConfig};
    use crate::context::ContextStore;
    use crate::registry::Registry;
    use crate::security::SecurityManager;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use regennexus_core::AdapterDescriptor;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct BlinkAdapter {
        initialized: AtomicUsize,
        shutdowns: AtomicUsize,
    }

    #[async_trait]
    impl DeviceAdapter for BlinkAdapter {
        fn descriptor(&self) -> AdapterDescriptor {
            AdapterDescriptor::new("led-board").with_capabilities(["gpio.led"])
        }

        async fn initialize(&self) -> Result<(), BoxError> {
            self.initialized.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        async fn shutdown(&self) -> Result<(), BoxError> {
            self.shutdowns.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        async fn execute_command(&self, command: &str, params: Json) -> Result<Json, BoxError> {
            match command {
                "blink" => Ok(json!({"ok": true, "times": params["times"]})),
                _ => Err(format!("unsupported command: {command}").into()),
            }
        }
    }

    fn router() -> Arc<Router> {
        let security_config = SecurityConfig::default();
        Arc::new(Router::new(
            Arc::new(Registry::new(RegistryConfig::default())),
            Arc::new(SecurityManager::new(security_config.clone())),
            Arc::new(ContextStore::default()),
            &security_config,
        ))
    }

    fn session_config() -> SessionConfig {
        SessionConfig {
            security_enabled: false,
            ..Default::default()
        }
    }

    async fn client(router: &Arc<Router>, id: &str) -> Session {
        let options = SessionOptions::from_config(&session_config());
        let session = Session::new(id, router.clone(), options).unwrap();
        session.connect().await.unwrap();
        session
    }

    #[tokio::test]
    async fn test_command_dispatch() {
        let router = router();
        let adapter = Arc::new(BlinkAdapter {
            initialized: AtomicUsize::new(0),
            shutdowns: AtomicUsize::new(0),
        });
        let runtime =
            AdapterRuntime::new(adapter.clone(), router.clone(), &session_config()).unwrap();
        runtime.start().await.unwrap();
        assert_eq!(adapter.initialized.load(Ordering::Relaxed), 1);

        let alice = client(&router, "alice").await;

        let response = alice
            .send(Message::new(
                "alice",
                "led-board",
                "command.blink",
                json!({"times": 3}),
            ))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response.payload, json!({"ok": true, "times": 3}));

        // unsupported commands answer with an error response
        let response = alice
            .send(Message::new("alice", "led-board", "command.melt", json!({})))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response.intent, intents::ERROR);
        assert_eq!(response.payload["error_code"], json!("command_failed"));
        assert_eq!(response.payload["original_intent"], json!("command.melt"));

        // registered command handlers take precedence over the adapter
        runtime.register_command_handler("blink", |_params| async move {
            Ok(json!({"overridden": true}))
        });
        let response = alice
            .send(Message::new("alice", "led-board", "command.blink", json!({})))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response.payload, json!({"overridden": true}));

        alice.disconnect().await.unwrap();
        runtime.stop().await.unwrap();
        assert_eq!(adapter.shutdowns.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_event_broadcast_reaches_subscribers_once() {
        let router = router();
        let adapter = Arc::new(BlinkAdapter {
            initialized: AtomicUsize::new(0),
            shutdowns: AtomicUsize::new(0),
        });
        let runtime =
            AdapterRuntime::new(adapter, router.clone(), &session_config()).unwrap();
        runtime.start().await.unwrap();

        let dashboard = client(&router, "dashboard").await;
        let logger = client(&router, "logger").await;
        let dashboard_seen: Arc<Mutex<Vec<Message>>> = Arc::new(Mutex::new(Vec::new()));
        let logger_seen: Arc<Mutex<Vec<Message>>> = Arc::new(Mutex::new(Vec::new()));
        for (session, seen) in [(&dashboard, &dashboard_seen), (&logger, &logger_seen)] {
            let seen = seen.clone();
            session.register_message_handler(handler_fn(move |message: Message| {
                let seen = seen.clone();
                async move {
                    seen.lock().push(message);
                    Ok(None)
                }
            }));
        }

        runtime
            .emit_event("sensor_reading", json!({"value": 22.5, "unit": "C"}))
            .await
            .unwrap();

        let dashboard_seen = dashboard_seen.lock();
        let logger_seen = logger_seen.lock();
        assert_eq!(dashboard_seen.len(), 1);
        assert_eq!(logger_seen.len(), 1);
        assert_eq!(dashboard_seen[0].intent, "event.sensor_reading");
        assert_eq!(dashboard_seen[0].sender, "led-board");
        assert_eq!(dashboard_seen[0].payload, json!({"value": 22.5, "unit": "C"}));

        dashboard.disconnect().await.unwrap();
        logger.disconnect().await.unwrap();
        runtime.stop().await.unwrap();
    }
}
