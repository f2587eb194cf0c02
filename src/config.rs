use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RelayError, Result};
use crate::rules::{ModelMapping, ProviderNode};

/// Recognized runtime options. TOML `[settings]` values are overridden by
/// `MODELRELAY_*` environment variables.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts_per_candidate: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_per_attempt_timeout_ms")]
    pub per_attempt_timeout_ms: u64,
    /// Treat timeouts and transport errors as an immediate failover
    /// instead of the retry-same-candidate class.
    #[serde(default)]
    pub transport_error_failover_immediately: bool,
    #[serde(default = "default_listen")]
    pub listen: String,
}

fn default_retry_max_attempts() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    1000
}

fn default_per_attempt_timeout_ms() -> u64 {
    120_000
}

fn default_listen() -> String {
    "127.0.0.1:8080".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            retry_max_attempts_per_candidate: default_retry_max_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            per_attempt_timeout_ms: default_per_attempt_timeout_ms(),
            transport_error_failover_immediately: false,
            listen: default_listen(),
        }
    }
}

impl Settings {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn per_attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.per_attempt_timeout_ms)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Some(value) = env_parse("MODELRELAY_RETRY_MAX_ATTEMPTS") {
            self.retry_max_attempts_per_candidate = value;
        }
        if let Some(value) = env_parse("MODELRELAY_RETRY_BACKOFF_MS") {
            self.retry_backoff_ms = value;
        }
        if let Some(value) = env_parse("MODELRELAY_PER_ATTEMPT_TIMEOUT_MS") {
            self.per_attempt_timeout_ms = value;
        }
        if let Ok(value) = std::env::var("MODELRELAY_LISTEN") {
            if !value.trim().is_empty() {
                self.listen = value;
            }
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok()?.trim().parse().ok()
}

/// Inbound API key the gateway itself accepts. Credential resolution is
/// external to the core; this is the config-backed implementation's data.
#[derive(Clone, Serialize, Deserialize)]
pub struct ApiKeyConfig {
    pub id: String,
    pub name: String,
    pub token: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl std::fmt::Debug for ApiKeyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiKeyConfig")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("token", &"<redacted>")
            .field("enabled", &self.enabled)
            .finish()
    }
}

/// Full gateway configuration as loaded from a TOML file.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub providers: Vec<ProviderNode>,
    #[serde(default)]
    pub models: Vec<ModelMapping>,
    #[serde(default)]
    pub api_keys: Vec<ApiKeyConfig>,
}

impl RelayConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: RelayConfig = toml::from_str(raw).map_err(|err| RelayError::Config {
            reason: format!("failed to parse config: {err}"),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for provider in &self.providers {
            if provider.id.trim().is_empty() {
                return Err(RelayError::Config {
                    reason: "provider id must not be empty".to_string(),
                });
            }
            if !seen.insert(provider.id.as_str()) {
                return Err(RelayError::Config {
                    reason: format!("duplicate provider id: {}", provider.id),
                });
            }
            if provider.base_url.trim().is_empty() {
                return Err(RelayError::Config {
                    reason: format!("provider {} has no base_url", provider.id),
                });
            }
        }

        let mut models = std::collections::HashSet::new();
        for mapping in &self.models {
            if !models.insert(mapping.requested_model.as_str()) {
                return Err(RelayError::Config {
                    reason: format!("duplicate model mapping: {}", mapping.requested_model),
                });
            }
            for rule in &mapping.rules {
                if !seen.contains(rule.provider_id.as_str()) {
                    return Err(RelayError::Config {
                        reason: format!(
                            "model {} references unknown provider {}",
                            mapping.requested_model, rule.provider_id
                        ),
                    });
                }
            }
        }
        Ok(())
    }
}
