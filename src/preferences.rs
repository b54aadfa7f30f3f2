//! Durable per-plugin preferences: enabled flags and settings values.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::di::lock;
use crate::error::Result;

/// Backing store for enabled flags and per-plugin settings.
///
/// `is_enabled` returning `None` means "no stored preference"; the host
/// then falls back to the manifest default.
pub trait PreferenceStore: Send + Sync {
    fn is_enabled(&self, plugin: &str) -> Option<bool>;
    fn set_enabled(&self, plugin: &str, enabled: bool) -> Result<()>;
    fn get_config(&self, plugin: &str) -> Option<Value>;
    fn set_config(&self, plugin: &str, config: Value) -> Result<()>;
    /// Drop every stored preference for `plugin`.
    fn remove(&self, plugin: &str) -> Result<()>;
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct PluginPrefs {
    #[serde(skip_serializing_if = "Option::is_none")]
    enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    config: Option<Value>,
}

/// Volatile store for tests and embedded hosts.
#[derive(Default)]
pub struct MemoryPreferenceStore {
    prefs: Mutex<HashMap<String, PluginPrefs>>,
}

impl MemoryPreferenceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PreferenceStore for MemoryPreferenceStore {
    fn is_enabled(&self, plugin: &str) -> Option<bool> {
        lock(&self.prefs).get(plugin).and_then(|p| p.enabled)
    }

    fn set_enabled(&self, plugin: &str, enabled: bool) -> Result<()> {
        lock(&self.prefs)
            .entry(plugin.to_string())
            .or_default()
            .enabled = Some(enabled);
        Ok(())
    }

    fn get_config(&self, plugin: &str) -> Option<Value> {
        lock(&self.prefs).get(plugin).and_then(|p| p.config.clone())
    }

    fn set_config(&self, plugin: &str, config: Value) -> Result<()> {
        lock(&self.prefs)
            .entry(plugin.to_string())
            .or_default()
            .config = Some(config);
        Ok(())
    }

    fn remove(&self, plugin: &str) -> Result<()> {
        lock(&self.prefs).remove(plugin);
        Ok(())
    }
}

/// JSON-file-backed store.
///
/// The file is loaded lazily on first access and rewritten whole on every
/// mutation via a temp file plus rename, so a crash mid-write never leaves
/// a truncated preferences file behind.
pub struct FilePreferenceStore {
    path: PathBuf,
    prefs: Mutex<Option<HashMap<String, PluginPrefs>>>,
}

impl FilePreferenceStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            prefs: Mutex::new(None),
        }
    }

    fn with_loaded<R>(&self, f: impl FnOnce(&mut HashMap<String, PluginPrefs>) -> R) -> R {
        let mut slot = lock(&self.prefs);
        let prefs = slot.get_or_insert_with(|| {
            std::fs::read(&self.path)
                .ok()
                .and_then(|raw| serde_json::from_slice(&raw).ok())
                .unwrap_or_default()
        });
        f(prefs)
    }

    fn persist(&self, prefs: &HashMap<String, PluginPrefs>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(prefs)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn mutate(&self, f: impl FnOnce(&mut HashMap<String, PluginPrefs>)) -> Result<()> {
        let mut slot = lock(&self.prefs);
        let prefs = slot.get_or_insert_with(|| {
            std::fs::read(&self.path)
                .ok()
                .and_then(|raw| serde_json::from_slice(&raw).ok())
                .unwrap_or_default()
        });
        f(prefs);
        self.persist(prefs)
    }
}

impl PreferenceStore for FilePreferenceStore {
    fn is_enabled(&self, plugin: &str) -> Option<bool> {
        self.with_loaded(|prefs| prefs.get(plugin).and_then(|p| p.enabled))
    }

    fn set_enabled(&self, plugin: &str, enabled: bool) -> Result<()> {
        self.mutate(|prefs| {
            prefs.entry(plugin.to_string()).or_default().enabled = Some(enabled);
        })
    }

    fn get_config(&self, plugin: &str) -> Option<Value> {
        self.with_loaded(|prefs| prefs.get(plugin).and_then(|p| p.config.clone()))
    }

    fn set_config(&self, plugin: &str, config: Value) -> Result<()> {
        self.mutate(|prefs| {
            prefs.entry(plugin.to_string()).or_default().config = Some(config);
        })
    }

    fn remove(&self, plugin: &str) -> Result<()> {
        self.mutate(|prefs| {
            prefs.remove(plugin);
        })
    }
}
