//! Per-conversation message history.
//!
//! The context store observes every successful delivery and appends the
//! message to the context named by its `context_id`, preserving delivery
//! order. Appends are idempotent per `(context_id, message_id)`: a message
//! is observed at most once per context, even across retries.
//!
//! Contexts live as long as messages keep arriving; idle ones may be
//! garbage-collected by [`ContextStore::expire_idle`] or the background
//! sweep task.

use parking_lot::RwLock;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use structured_logger::unix_ms;
use tokio_util::sync::CancellationToken;

use regennexus_core::Message;

use crate::config::ContextConfig;

/// An ordered record of messages sharing a `context_id`.
#[derive(Debug, Clone)]
pub struct Context {
    pub id: String,
    /// Unix milliseconds at creation.
    pub created_at: u64,
    /// Unix milliseconds of the last append.
    pub last_active: u64,
    messages: VecDeque<Message>,
    seen: HashSet<String>,
    max_size: Option<usize>,
}

impl Context {
    fn new(id: String, max_size: Option<usize>) -> Self {
        let now = unix_ms();
        Self {
            id,
            created_at: now,
            last_active: now,
            messages: VecDeque::new(),
            seen: HashSet::new(),
            max_size,
        }
    }

    /// Appends a message, evicting the oldest entry when the bound is
    /// exceeded. Returns false for an already-observed message ID.
    fn push(&mut self, message: Message) -> bool {
        if !self.seen.insert(message.id.clone()) {
            return false;
        }
        self.messages.push_back(message);
        if let Some(max_size) = self.max_size
            && self.messages.len() > max_size
        {
            self.messages.pop_front();
        }
        self.last_active = unix_ms();
        true
    }

    /// Messages in delivery order.
    pub fn messages(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// Shared store of conversation contexts.
pub struct ContextStore {
    contexts: RwLock<HashMap<String, Context>>,
    max_context_size: Option<usize>,
}

impl Default for ContextStore {
    fn default() -> Self {
        Self::new(None)
    }
}

impl ContextStore {
    /// Creates a store; `max_context_size` bounds every context created
    /// through it (unbounded when `None`).
    pub fn new(max_context_size: Option<usize>) -> Self {
        Self {
            contexts: RwLock::new(HashMap::new()),
            max_context_size,
        }
    }

    /// Creates a fresh context and returns its ID.
    pub fn create_context(&self) -> String {
        let id = xid::new().to_string();
        self.create_context_with_id(&id);
        id
    }

    /// Ensures a context with the given ID exists.
    pub fn create_context_with_id(&self, context_id: &str) {
        self.contexts
            .write()
            .entry(context_id.to_string())
            .or_insert_with(|| Context::new(context_id.to_string(), self.max_context_size));
    }

    /// Appends a message to its context, creating the context on first use.
    /// Idempotent per `(context_id, message_id)`; returns whether the
    /// message was actually appended.
    pub fn add_message(&self, context_id: &str, message: &Message) -> bool {
        let mut contexts = self.contexts.write();
        let context = contexts
            .entry(context_id.to_string())
            .or_insert_with(|| Context::new(context_id.to_string(), self.max_context_size));
        context.push(message.clone())
    }

    /// A snapshot of one context.
    pub fn get_context(&self, context_id: &str) -> Option<Context> {
        self.contexts.read().get(context_id).cloned()
    }

    pub fn list_contexts(&self) -> Vec<String> {
        self.contexts.read().keys().cloned().collect()
    }

    /// Removes contexts with no activity for at least `age`; returns how
    /// many were collected.
    pub fn expire_idle(&self, age: Duration) -> usize {
        let cutoff = unix_ms().saturating_sub(age.as_millis() as u64);
        let mut contexts = self.contexts.write();
        let before = contexts.len();
        contexts.retain(|_, context| context.last_active > cutoff);
        let removed = before - contexts.len();
        if removed > 0 {
            log::debug!(removed = removed; "expired idle contexts");
        }
        removed
    }

    /// Spawns the background sweep task; a no-op when the config sets no
    /// idle expiry. The task stops when the token is cancelled.
    pub fn start_sweep(self: &Arc<Self>, config: &ContextConfig, token: CancellationToken) {
        let Some(idle_expiry_secs) = config.idle_expiry_secs else {
            return;
        };
        let store = self.clone();
        let interval = Duration::from_secs(config.sweep_interval_secs.max(1));
        let age = Duration::from_secs(idle_expiry_secs);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        store.expire_idle(age);
                    }
                }
            }
        });
    }
}
