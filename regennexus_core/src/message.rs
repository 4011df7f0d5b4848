//! Message and envelope wire forms.
//!
//! A [`Message`] is the unit of exchange between entities: an immutable,
//! intent-tagged record carrying a schema-free payload. An [`Envelope`] is
//! the sealed wire form produced by the security manager for confidential
//! delivery. [`Wire`] is the sum of the two as seen at a transport seam.
//!
//! # Key invariants
//! - A message with `ttl` set must not be delivered after
//!   `timestamp + ttl`.
//! - `recipient == "*"` is the sole broadcast form.
//! - The canonical signing bytes of a message are its sorted-key JSON with
//!   the `signature` field absent.

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::Error;
use crate::json::{Json, to_canonical_json};
use crate::unix_seconds;

/// Reserved intents. All other dotted intent strings are user-defined.
pub mod intents {
    /// Acknowledgment response produced by the session helpers.
    pub static ACK: &str = "ack";
    /// Error response produced by the session helpers.
    pub static ERROR: &str = "error";
    /// Registry control plane: announce an entity over a remote transport.
    pub static REGISTRY_REGISTER: &str = "registry.register";
    /// Registry control plane: discover entities over a remote transport.
    pub static REGISTRY_DISCOVER: &str = "registry.discover";
    /// Liveness probe request.
    pub static STATUS_REQUEST: &str = "status.request";
    /// Liveness probe response.
    pub static STATUS_RESPONSE: &str = "status.response";
    /// Prefix for asynchronous events emitted by device adapters.
    pub static EVENT_PREFIX: &str = "event.";
    /// Prefix for commands addressed to device adapters.
    pub static COMMAND_PREFIX: &str = "command.";
}

/// The only encryption algorithm emitted by this implementation.
pub static ENVELOPE_ALGORITHM: &str = "ECDH-384+AES-256-GCM";

fn empty_object() -> Json {
    Json::Object(Default::default())
}

fn is_false(v: &bool) -> bool {
    !v
}

/// An intent-tagged protocol message.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Message {
    /// Unique message ID.
    pub id: String,
    /// Entity ID of the sender.
    pub sender: String,
    /// Entity ID of the recipient, or `*` for broadcast.
    pub recipient: String,
    /// Dotted string naming the message's purpose, e.g. `command.start`.
    pub intent: String,
    /// Schema-free payload tree.
    #[serde(default = "empty_object")]
    pub payload: Json,
    /// Conversation thread this message belongs to.
    #[serde(default)]
    pub context_id: String,
    /// Unix seconds at creation.
    pub timestamp: u64,
    /// Optional time-to-live in seconds; expired messages are never delivered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
    /// Whether the payload travelled sealed. Always false on the plaintext form.
    #[serde(default, skip_serializing_if = "is_false")]
    pub encrypted: bool,
    /// Optional hex-encoded ECDSA signature over the canonical form.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl Message {
    /// Creates a message with a fresh ID, timestamp and context.
    pub fn new(
        sender: impl Into<String>,
        recipient: impl Into<String>,
        intent: impl Into<String>,
        payload: Json,
    ) -> Self {
        Self {
            id: xid::new().to_string(),
            sender: sender.into(),
            recipient: recipient.into(),
            intent: intent.into(),
            payload,
            context_id: xid::new().to_string(),
            timestamp: unix_seconds(),
            ttl: None,
            encrypted: false,
            signature: None,
        }
    }

    /// Threads this message into an existing context.
    pub fn with_context(mut self, context_id: impl Into<String>) -> Self {
        self.context_id = context_id.into();
        self
    }

    /// Sets the time-to-live in seconds.
    pub fn with_ttl(mut self, ttl: u64) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Whether the TTL elapsed. Messages without a TTL never expire.
    pub fn is_expired(&self) -> bool {
        match self.ttl {
            Some(ttl) => unix_seconds() > self.timestamp + ttl,
            None => false,
        }
    }

    /// Whether this message is addressed to every registered entity.
    pub fn is_broadcast(&self) -> bool {
        self.recipient == crate::BROADCAST_RECIPIENT
    }

    /// Validates the message shape and TTL.
    pub fn validate(&self) -> Result<(), Error> {
        if self.sender.is_empty() {
            return Err(Error::InvalidMessage("missing sender".to_string()));
        }
        if self.recipient.is_empty() {
            return Err(Error::InvalidMessage("missing recipient".to_string()));
        }
        if self.intent.is_empty() {
            return Err(Error::InvalidMessage("missing intent".to_string()));
        }
        if self.is_expired() {
            return Err(Error::Expired(self.id.clone()));
        }
        Ok(())
    }

    /// Canonical byte form used for signing: sorted-key JSON with the
    /// `signature` field absent.
    pub fn signing_bytes(&self) -> Result<Vec<u8>, Error> {
        let mut unsigned = self.clone();
        unsigned.signature = None;
        to_canonical_json(&unsigned)
    }

    /// Creates a response to `request`, addressed back to its sender and
    /// threaded into the same context, with `id = "response-" + request.id`.
    pub fn response(request: &Message, intent: impl Into<String>, payload: Json) -> Self {
        Self {
            id: format!("response-{}", request.id),
            sender: request.recipient.clone(),
            recipient: request.sender.clone(),
            intent: intent.into(),
            payload,
            context_id: request.context_id.clone(),
            timestamp: unix_seconds(),
            ttl: None,
            encrypted: false,
            signature: None,
        }
    }

    /// Creates an `error` response carrying the code, text and original intent.
    pub fn error_response(
        request: &Message,
        error_code: impl Into<String>,
        error_message: impl Into<String>,
    ) -> Self {
        Self::response(
            request,
            intents::ERROR,
            json!({
                "error_code": error_code.into(),
                "error_message": error_message.into(),
                "original_intent": request.intent,
            }),
        )
    }

    /// Creates an `ack` response to `request`.
    pub fn ack_response(request: &Message) -> Self {
        Self::response(
            request,
            intents::ACK,
            json!({
                "original_intent": request.intent,
                "timestamp": unix_seconds(),
            }),
        )
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Message(id={}, sender={}, recipient={}, intent={})",
            self.id, self.sender, self.recipient, self.intent
        )
    }
}

/// The sealed wire form of a message.
///
/// Only the addressed recipient can derive the shared key; the sender's
/// public key travels in the envelope so a standalone decryptor can complete
/// the handshake without a prior key exchange.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Envelope {
    /// Always [`ENVELOPE_ALGORITHM`] for envelopes produced here.
    pub algorithm: String,
    pub sender: String,
    pub recipient: String,
    /// Always true on the sealed form.
    pub encrypted: bool,
    /// ID of the sealed message, carried in clear for tracing.
    pub id: String,
    /// Timestamp of the sealed message, carried in clear.
    pub timestamp: u64,
    /// Hex-encoded DER (SPKI) public key of the sender.
    pub sender_public_key: String,
    /// Base64-encoded 96-bit nonce.
    pub nonce: String,
    /// Base64-encoded AES-256-GCM ciphertext (tag appended).
    pub ciphertext: String,
}

/// A message as seen at a transport seam: sealed or plaintext.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum Wire {
    Sealed(Envelope),
    Plain(Message),
}

impl Wire {
    pub fn sender(&self) -> &str {
        match self {
            Wire::Sealed(env) => &env.sender,
            Wire::Plain(msg) => &msg.sender,
        }
    }

    pub fn recipient(&self) -> &str {
        match self {
            Wire::Sealed(env) => &env.recipient,
            Wire::Plain(msg) => &msg.recipient,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Wire::Sealed(env) => &env.id,
            Wire::Plain(msg) => &msg.id,
        }
    }
}

impl From<Message> for Wire {
    fn from(msg: Message) -> Self {
        Wire::Plain(msg)
    }
}

impl From<Envelope> for Wire {
    fn from(env: Envelope) -> Self {
        Wire::Sealed(env)
    }
}
