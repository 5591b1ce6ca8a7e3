//! Typed configuration from environment variables.
//!
//! Every knob has a default; environment variables override individually.
//! Parse failures fail fast rather than silently running with defaults.
//! In local dev, call `dotenvy::dotenv().ok()` before loading.

use std::time::Duration;

use secrecy::SecretString;

use crate::cache::CacheConfig;
use crate::error::{Error, Result};
use crate::registry::RegistryConfig;

#[derive(Debug, Clone)]
pub struct Config {
    /// Per-request timeout applied when a call carries no override.
    pub default_timeout: Duration,
    /// Future-registry tuning.
    pub registry: RegistryConfig,
    /// Result-cache tuning.
    pub cache: CacheConfig,
    /// Bearer token for the HTTP transport. Never logged.
    pub auth_token: Option<SecretString>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
            registry: RegistryConfig {
                cleanup_delay: Duration::from_secs(30),
                ..RegistryConfig::default()
            },
            cache: CacheConfig::default(),
            auth_token: None,
        }
    }
}

impl Config {
    /// Load configuration, applying any environment overrides:
    /// `FETCHQ_DEFAULT_TIMEOUT_MS`, `FETCHQ_CLEANUP_DELAY_MS`,
    /// `FETCHQ_MAX_PENDING`, `FETCHQ_CACHE_TTL_MS`,
    /// `FETCHQ_CACHE_MAX_ENTRIES`, `FETCHQ_AUTH_TOKEN`.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Some(timeout) = env_millis("FETCHQ_DEFAULT_TIMEOUT_MS")? {
            config.default_timeout = timeout;
        }
        if let Some(delay) = env_millis("FETCHQ_CLEANUP_DELAY_MS")? {
            config.registry.cleanup_delay = delay;
        }
        if let Some(max) = env_count("FETCHQ_MAX_PENDING")? {
            config.registry.max_pending = max;
        }
        if let Some(ttl) = env_millis("FETCHQ_CACHE_TTL_MS")? {
            config.cache.default_ttl = ttl;
        }
        if let Some(max) = env_count("FETCHQ_CACHE_MAX_ENTRIES")? {
            config.cache.max_entries = max;
        }
        if let Ok(token) = std::env::var("FETCHQ_AUTH_TOKEN") {
            config.auth_token = Some(SecretString::from(token));
        }
        Ok(config)
    }
}

fn env_millis(name: &str) -> Result<Option<Duration>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse::<u64>()
            .map(|ms| Some(Duration::from_millis(ms)))
            .map_err(|_| Error::Config(format!("{name} must be an integer (milliseconds)"))),
        Err(_) => Ok(None),
    }
}

fn env_count(name: &str) -> Result<Option<usize>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse::<usize>()
            .map(Some)
            .map_err(|_| Error::Config(format!("{name} must be a non-negative integer"))),
        Err(_) => Ok(None),
    }
}
