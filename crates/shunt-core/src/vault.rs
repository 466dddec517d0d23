//! Flat JSON secret store.
//!
//! A single file of string pairs; the whole map is injected into every
//! supervised child's environment. A missing file reads as an empty map so
//! a fresh install works before any secret is set.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct Vault {
    path: PathBuf,
}

impl Vault {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn to_map(&self) -> anyhow::Result<BTreeMap<String, String>> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!("vault file {} not found, empty map", self.path.display());
                return Ok(BTreeMap::new());
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("reading vault {}", self.path.display()))
            }
        };
        serde_json::from_str(&raw)
            .with_context(|| format!("vault {} is not a JSON string map", self.path.display()))
    }

    pub fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        Ok(self.to_map()?.remove(key))
    }

    pub fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
        let mut map = self.to_map()?;
        map.insert(key.to_string(), value.to_string());
        self.write(&map)
    }

    pub fn delete(&self, key: &str) -> anyhow::Result<bool> {
        let mut map = self.to_map()?;
        let removed = map.remove(key).is_some();
        if removed {
            self.write(&map)?;
        }
        Ok(removed)
    }

    /// Render as environment pairs for a child process.
    pub fn to_env(&self) -> anyhow::Result<Vec<(String, String)>> {
        Ok(self.to_map()?.into_iter().collect())
    }

    fn write(&self, map: &BTreeMap<String, String>) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let raw = serde_json::to_string_pretty(map)?;
        fs::write(&self.path, raw)
            .with_context(|| format!("writing vault {}", self.path.display()))
    }
}
