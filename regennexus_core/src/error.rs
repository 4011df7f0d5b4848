//! Protocol error taxonomy.
//!
//! Every fallible operation in the core surfaces exactly one of these kinds.
//! The variants are grouped by who can act on them:
//! - caller-recoverable: [`Error::NotConnected`], [`Error::Shutdown`],
//!   [`Error::Backpressure`], [`Error::Cancelled`]
//! - caller-fixable: [`Error::AlreadyRegistered`], [`Error::UnknownEntity`],
//!   [`Error::InvalidEntityId`], [`Error::InvalidMessage`]
//! - security: [`Error::PolicyDenied`], [`Error::AuthenticationFailed`],
//!   [`Error::Decrypt`], [`Error::SignatureInvalid`]
//! - configuration: [`Error::KeyNotFound`], [`Error::KeyFormat`]
//!
//! Decrypt and signature failures are deliberately terse: details are logged
//! at warning level and never echoed back to untrusted peers.

/// Possible errors when working with the protocol core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The session has not been connected yet.
    #[error("session {0:?} is not connected")]
    NotConnected(String),

    /// The session is shutting down or closed; no further sends are accepted.
    #[error("session {0:?} is shut down")]
    Shutdown(String),

    /// An entity with this ID is already registered.
    #[error("entity {0:?} is already registered")]
    AlreadyRegistered(String),

    /// The recipient is not registered, or is marked stale.
    #[error("unknown entity {0:?}")]
    UnknownEntity(String),

    /// The entity ID does not satisfy the directory naming rules.
    #[error("invalid entity ID: {0}")]
    InvalidEntityId(String),

    /// The message is structurally invalid (missing sender, recipient or intent).
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// The policy engine denied the operation.
    #[error("policy denied {action:?} on {resource:?} for {entity:?}")]
    PolicyDenied {
        entity: String,
        resource: String,
        action: String,
    },

    /// Certificate or token authentication failed. The message is discarded.
    #[error("authentication failed for {0:?}")]
    AuthenticationFailed(String),

    /// AEAD open failed or the envelope is malformed. Never partially
    /// reveals plaintext.
    #[error("decryption failed")]
    Decrypt,

    /// A message or certificate signature did not verify.
    #[error("signature invalid")]
    SignatureInvalid,

    /// The recipient's receive queue is full; the caller may retry with back-off.
    #[error("receive queue for {0:?} is full")]
    Backpressure(String),

    /// The message's TTL elapsed before delivery.
    #[error("message {0:?} expired")]
    Expired(String),

    /// The send deadline elapsed or the operation was cancelled. The target
    /// may still receive and process the message.
    #[error("operation cancelled")]
    Cancelled,

    /// No key material is stored for this entity.
    #[error("no key found for {0:?}")]
    KeyNotFound(String),

    /// Key material could not be parsed (bad PEM/DER).
    #[error("key format error: {0}")]
    KeyFormat(String),

    /// Every handler failed without producing a response.
    #[error("handler failed for intent {intent:?}: {reason}")]
    HandlerFailure { intent: String, reason: String },

    /// Serialization or deserialization of a wire form failed.
    #[error("codec error: {0}")]
    Codec(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Codec(err.to_string())
    }
}
