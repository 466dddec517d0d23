//! Layered runtime settings.
//!
//! Three layers, lowest to highest precedence: built-in defaults, the
//! `config.json` next to the storage root, and `SHUNT_`-prefixed environment
//! variables. The merged value lives behind an `RwLock` so long-running
//! tasks observe `reload()` without restarting.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::warn;

const ENV_PREFIX: &str = "SHUNT_";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub log_level: String,
    /// Working directory the agent CLIs run in; also holds history trees.
    pub agent_home_path: PathBuf,
    /// Root for provider homes, session logs and other managed state.
    pub storage_path: PathBuf,
    pub vault_path: PathBuf,
    pub heartbeat_cooldown_seconds: u64,
    pub on_demand_cooldown_seconds: u64,
    /// Delay before the one-shot startup heartbeat check.
    pub initial_idle_seconds: u64,
    /// Comma-separated failover order, entries as `kind` or `kind:profile`.
    pub agent_use_order: String,
    pub enable_telegram: bool,
}

impl Default for Settings {
    fn default() -> Self {
        let root = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".shunt");
        Self {
            log_level: "info".to_string(),
            agent_home_path: root.join("agent"),
            storage_path: root.join("storage"),
            vault_path: root.join("vault.json"),
            heartbeat_cooldown_seconds: 600,
            on_demand_cooldown_seconds: 600,
            initial_idle_seconds: 600,
            agent_use_order: "codex,gemini".to_string(),
            enable_telegram: false,
        }
    }
}

impl Settings {
    fn apply_file_layer(&mut self, raw: &str) {
        let overrides: Value = match serde_json::from_str(raw) {
            Ok(value) => value,
            Err(err) => {
                warn!("config.json is not valid JSON, keeping defaults: {err}");
                return;
            }
        };
        let mut merged = match serde_json::to_value(&*self) {
            Ok(value) => value,
            Err(_) => return,
        };
        deep_merge(&mut merged, &overrides);
        match serde_json::from_value(merged) {
            Ok(settings) => *self = settings,
            Err(err) => warn!("config.json has unusable field types: {err}"),
        }
    }

    fn apply_env_layer(&mut self) {
        for (key, value) in std::env::vars() {
            let Some(field) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            match field {
                "LOG_LEVEL" => self.log_level = value,
                "AGENT_HOME_PATH" => self.agent_home_path = PathBuf::from(value),
                "STORAGE_PATH" => self.storage_path = PathBuf::from(value),
                "VAULT_PATH" => self.vault_path = PathBuf::from(value),
                "HEARTBEAT_COOLDOWN_SECONDS" => {
                    parse_into(&mut self.heartbeat_cooldown_seconds, &key, &value)
                }
                "ON_DEMAND_COOLDOWN_SECONDS" => {
                    parse_into(&mut self.on_demand_cooldown_seconds, &key, &value)
                }
                "INITIAL_IDLE_SECONDS" => {
                    parse_into(&mut self.initial_idle_seconds, &key, &value)
                }
                "AGENT_USE_ORDER" => self.agent_use_order = value,
                "ENABLE_TELEGRAM" => parse_into(&mut self.enable_telegram, &key, &value),
                _ => {}
            }
        }
    }
}

fn parse_into<T: std::str::FromStr>(slot: &mut T, key: &str, value: &str) {
    match value.parse() {
        Ok(parsed) => *slot = parsed,
        Err(_) => warn!("ignoring unparsable env override {key}={value}"),
    }
}

fn deep_merge(base: &mut Value, patch: &Value) {
    match (base, patch) {
        (Value::Object(base_map), Value::Object(patch_map)) => {
            for (key, patch_value) in patch_map {
                match base_map.get_mut(key) {
                    Some(base_value) => deep_merge(base_value, patch_value),
                    None => {
                        base_map.insert(key.clone(), patch_value.clone());
                    }
                }
            }
        }
        (base_slot, patch_value) => *base_slot = patch_value.clone(),
    }
}

/// Shared handle over the merged settings.
#[derive(Clone)]
pub struct SettingsStore {
    config_path: PathBuf,
    inner: Arc<RwLock<Settings>>,
}

impl SettingsStore {
    /// Load from `config_path` (missing file is fine) and the environment.
    pub async fn load(config_path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let config_path = config_path.as_ref().to_path_buf();
        let settings = Self::compose(&config_path).await?;
        Ok(Self {
            config_path,
            inner: Arc::new(RwLock::new(settings)),
        })
    }

    async fn compose(config_path: &Path) -> anyhow::Result<Settings> {
        let mut settings = Settings::default();
        match fs::read_to_string(config_path).await {
            Ok(raw) if !raw.trim().is_empty() => settings.apply_file_layer(&raw),
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("reading settings file {}", config_path.display())
                })
            }
        }
        settings.apply_env_layer();
        Ok(settings)
    }

    pub async fn get(&self) -> Settings {
        self.inner.read().await.clone()
    }

    /// Re-read the file and environment layers in place.
    pub async fn reload(&self) -> anyhow::Result<()> {
        let settings = Self::compose(&self.config_path).await?;
        *self.inner.write().await = settings;
        Ok(())
    }
}
