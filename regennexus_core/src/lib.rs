pub mod adapter;
pub mod entity;
pub mod error;
pub mod json;
pub mod message;

pub use adapter::*;
pub use entity::*;
pub use error::Error;
pub use json::*;
pub use message::*;

pub use tokio_util::sync::CancellationToken;

/// A type alias for a boxed error that is thread-safe and sendable across threads.
/// This is commonly used as a return type for functions that can return various error types.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A type alias for a boxed future that is thread-safe and sendable across threads.
pub type BoxPinFut<T> = std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send>>;

/// The broadcast recipient sentinel. A message addressed to it is fanned out
/// to every registered entity except the sender.
pub static BROADCAST_RECIPIENT: &str = "*";

/// Validates an entity ID against the directory naming rules.
///
/// # Rules
/// - Must not be empty
/// - Must not exceed 64 characters
/// - Must start with a lowercase letter
/// - Can only contain: lowercase letters (a-z), digits (0-9), `_` and `-`
///
/// `*` is reserved for broadcast and is never a valid entity ID.
pub fn validate_entity_id(id: &str) -> Result<(), Error> {
    if id.is_empty() {
        return Err(Error::InvalidEntityId("empty entity ID".to_string()));
    }
    if id.len() > 64 {
        return Err(Error::InvalidEntityId(format!(
            "entity ID {id:?} exceeds 64 characters"
        )));
    }
    if !id.starts_with(|c: char| c.is_ascii_lowercase()) {
        return Err(Error::InvalidEntityId(format!(
            "entity ID {id:?} must start with a lowercase letter"
        )));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
    {
        return Err(Error::InvalidEntityId(format!(
            "entity ID {id:?} contains invalid characters"
        )));
    }
    Ok(())
}

/// Returns the current Unix time in whole seconds.
pub fn unix_seconds() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_entity_id() {
        assert!(validate_entity_id("alice").is_ok());
        assert!(validate_entity_id("temp_sensor-1").is_ok());
        assert!(validate_entity_id("").is_err());
        assert!(validate_entity_id("*").is_err());
        assert!(validate_entity_id("Alice").is_err());
        assert!(validate_entity_id("9lives").is_err());
        assert!(validate_entity_id("a.b").is_err());
        assert!(validate_entity_id(&"a".repeat(65)).is_err());
    }
}
