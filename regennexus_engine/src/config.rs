//! Engine configuration.
//!
//! Every knob has a sensible default, so `ProtocolConfig::default()` is a
//! working in-process deployment. Deployments load overrides from TOML.

use config::{Config, File, FileFormat};
use serde::{Deserialize, Serialize};

use regennexus_core::BoxError;

/// Registry liveness tuning.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RegistryConfig {
    /// Entities with no heartbeat for this long are marked stale, unless
    /// they declare an `update_frequency` (then 3x that wins).
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
    /// Cadence of the background stale sweeper.
    #[serde(default = "default_registry_sweep_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: default_stale_after_secs(),
            sweep_interval_secs: default_registry_sweep_secs(),
        }
    }
}

/// Context store lifetime tuning.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ContextConfig {
    /// Maximum messages kept per context; oldest are evicted when exceeded.
    /// Unbounded when absent.
    #[serde(default)]
    pub max_context_size: Option<usize>,
    /// Contexts idle for this long are garbage-collected by
    /// [`crate::ContextStore::expire_idle`] and the sweep task. Never
    /// collected when absent.
    #[serde(default)]
    pub idle_expiry_secs: Option<u64>,
    #[serde(default = "default_context_sweep_secs")]
    pub sweep_interval_secs: u64,
}

/// Per-session tuning.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionConfig {
    /// Bounded receive queue depth; a full queue fails sends with
    /// `Backpressure` instead of blocking.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Whether sessions seal non-broadcast messages end to end.
    #[serde(default = "default_true")]
    pub security_enabled: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            security_enabled: default_true(),
        }
    }
}

/// Router/security enforcement tuning.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SecurityConfig {
    /// When true, the router consults the policy engine for every delivery.
    #[serde(default)]
    pub enforce_policy: bool,
    /// When true, the router rejects messages from unregistered senders.
    #[serde(default)]
    pub require_registered_sender: bool,
    #[serde(default = "default_shared_key_cache_capacity")]
    pub shared_key_cache_capacity: u64,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            enforce_policy: false,
            require_registered_sender: false,
            shared_key_cache_capacity: default_shared_key_cache_capacity(),
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ProtocolConfig {
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub security: SecurityConfig,
}

impl ProtocolConfig {
    pub fn from_file(file_name: &str) -> Result<Self, BoxError> {
        let builder = Config::builder().add_source(File::new(file_name, FileFormat::Toml));
        let cfg = builder.build()?.try_deserialize::<ProtocolConfig>()?;
        Ok(cfg)
    }

    pub fn from_toml(content: &str) -> Result<Self, BoxError> {
        let cfg: Self = toml::from_str(content)?;
        Ok(cfg)
    }
}

fn default_stale_after_secs() -> u64 {
    60
}

fn default_registry_sweep_secs() -> u64 {
    5
}

fn default_context_sweep_secs() -> u64 {
    60
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_shared_key_cache_capacity() -> u64 {
    1024
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = ProtocolConfig::default();
        assert_eq!(cfg.registry.stale_after_secs, 60);
        assert_eq!(cfg.session.queue_capacity, 1024);
        assert!(cfg.session.security_enabled);
        assert!(!cfg.security.enforce_policy);
        assert_eq!(cfg.context.max_context_size, None);
    }

    #[test]
    fn test_from_toml() {
        let cfg = ProtocolConfig::from_toml(
            r#"
            [registry]
            stale_after_secs = 2

            [session]
            queue_capacity = 8
            security_enabled = false

            [security]
            enforce_policy = true

            [context]
            max_context_size = 100
            "#,
        )
        .unwrap();
        assert_eq!(cfg.registry.stale_after_secs, 2);
        assert_eq!(cfg.registry.sweep_interval_secs, 5);
        assert_eq!(cfg.session.queue_capacity, 8);
        assert!(!cfg.session.security_enabled);
        assert!(cfg.security.enforce_policy);
        assert_eq!(cfg.context.max_context_size, Some(100));
    }
}
