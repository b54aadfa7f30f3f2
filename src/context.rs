//! Per-plugin runtime context: the capability surface handed to factories.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::di::lock;
use crate::disposable::{Disposer, DisposerGroup};
use crate::error::Result;
use crate::preferences::PreferenceStore;
use crate::registry::{ServiceRegistry, ServiceValue};

/// Outbound message channel to whatever UI or peer process the embedder
/// attaches. The default host wires a [`NullMessenger`].
pub trait Messenger: Send + Sync {
    fn broadcast(&self, channel: &str, payload: Value);
}

/// Drops messages, logging them at debug level.
#[derive(Default)]
pub struct NullMessenger;

impl Messenger for NullMessenger {
    fn broadcast(&self, channel: &str, payload: Value) {
        tracing::debug!(channel, %payload, "broadcast dropped, no messenger attached");
    }
}

/// Structured logger carrying the plugin name on every event.
#[derive(Clone)]
pub struct PluginLogger {
    plugin: Arc<str>,
}

impl PluginLogger {
    pub fn debug(&self, message: &str) {
        tracing::debug!(plugin = %self.plugin, "{}", message);
    }

    pub fn info(&self, message: &str) {
        tracing::info!(plugin = %self.plugin, "{}", message);
    }

    pub fn warn(&self, message: &str) {
        tracing::warn!(plugin = %self.plugin, "{}", message);
    }

    pub fn error(&self, message: &str) {
        tracing::error!(plugin = %self.plugin, "{}", message);
    }
}

type Watcher = Arc<dyn Fn(&Value) + Send + Sync>;

/// Namespaced settings cache layered over the preference store.
///
/// Values are loaded lazily per namespace and written through on every
/// mutation. Watchers fire after the store has been updated.
pub(crate) struct ConfigStore {
    preferences: Arc<dyn PreferenceStore>,
    cache: Mutex<HashMap<String, Value>>,
    watchers: Mutex<HashMap<String, Vec<(u64, Watcher)>>>,
    next_watcher: AtomicU64,
}

impl ConfigStore {
    pub(crate) fn new(preferences: Arc<dyn PreferenceStore>) -> Self {
        Self {
            preferences,
            cache: Mutex::new(HashMap::new()),
            watchers: Mutex::new(HashMap::new()),
            next_watcher: AtomicU64::new(1),
        }
    }

    /// Current value for a namespace, `{}` when nothing is stored.
    pub(crate) fn get(&self, namespace: &str) -> Value {
        let mut cache = lock(&self.cache);
        cache
            .entry(namespace.to_string())
            .or_insert_with(|| {
                self.preferences
                    .get_config(namespace)
                    .unwrap_or_else(|| Value::Object(Default::default()))
            })
            .clone()
    }

    /// Replace the whole namespace value.
    pub(crate) fn replace(&self, namespace: &str, value: Value) -> Result<()> {
        self.preferences.set_config(namespace, value.clone())?;
        lock(&self.cache).insert(namespace.to_string(), value.clone());
        self.notify(namespace, &value);
        Ok(())
    }

    /// Deep-merge a patch object into the namespace value.
    pub(crate) fn patch(&self, namespace: &str, patch: Value) -> Result<()> {
        let mut current = self.get(namespace);
        deep_merge(&mut current, patch);
        self.replace(namespace, current)
    }

    /// Set one dotted-path key inside the namespace value.
    pub(crate) fn set_value(&self, namespace: &str, path: &str, value: Value) -> Result<()> {
        let mut current = self.get(namespace);
        deep_set(&mut current, path, value);
        self.replace(namespace, current)
    }

    /// Clear the namespace back to `{}`.
    pub(crate) fn reset(&self, namespace: &str) -> Result<()> {
        self.replace(namespace, Value::Object(Default::default()))
    }

    /// Observe changes to a namespace. Returns a watcher id for [`unwatch`].
    ///
    /// [`unwatch`]: Self::unwatch
    pub(crate) fn watch(
        &self,
        namespace: &str,
        watcher: impl Fn(&Value) + Send + Sync + 'static,
    ) -> u64 {
        let id = self.next_watcher.fetch_add(1, Ordering::Relaxed);
        lock(&self.watchers)
            .entry(namespace.to_string())
            .or_default()
            .push((id, Arc::new(watcher)));
        id
    }

    pub(crate) fn unwatch(&self, namespace: &str, id: u64) {
        if let Some(list) = lock(&self.watchers).get_mut(namespace) {
            list.retain(|(watcher_id, _)| *watcher_id != id);
        }
    }

    fn notify(&self, namespace: &str, value: &Value) {
        // Snapshot outside the lock so watchers can mutate settings or
        // register/remove watchers without deadlocking.
        let watchers: Vec<Watcher> = lock(&self.watchers)
            .get(namespace)
            .map(|list| list.iter().map(|(_, w)| Arc::clone(w)).collect())
            .unwrap_or_default();
        for watcher in watchers {
            watcher(value);
        }
    }
}

/// A plugin's view onto its own settings namespace.
#[derive(Clone)]
pub struct SettingsHandle {
    namespace: Arc<str>,
    store: Arc<ConfigStore>,
}

impl SettingsHandle {
    pub(crate) fn new(namespace: &str, store: Arc<ConfigStore>) -> Self {
        Self {
            namespace: Arc::from(namespace),
            store,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// The whole settings object for this namespace.
    pub fn all(&self) -> Value {
        self.store.get(&self.namespace)
    }

    /// Look up a dotted-path key, e.g. `"appearance.theme"`.
    pub fn get(&self, path: &str) -> Option<Value> {
        deep_get(&self.all(), path).cloned()
    }

    pub fn set(&self, path: &str, value: Value) -> Result<()> {
        self.store.set_value(&self.namespace, path, value)
    }

    /// Deep-merge a patch object into the stored settings.
    pub fn patch(&self, patch: Value) -> Result<()> {
        self.store.patch(&self.namespace, patch)
    }

    pub fn reset(&self) -> Result<()> {
        self.store.reset(&self.namespace)
    }

    /// Observe settings changes. The id can be passed to
    /// [`SettingsHandle::unwatch`].
    pub fn on_change(&self, watcher: impl Fn(&Value) + Send + Sync + 'static) -> u64 {
        self.store.watch(&self.namespace, watcher)
    }

    pub fn unwatch(&self, id: u64) {
        self.store.unwatch(&self.namespace, id);
    }
}

/// Capability surface handed to a plugin factory.
///
/// Cheap to clone; everything a factory registers through it lands in the
/// plugin's disposer group and is released when the plugin unloads.
#[derive(Clone)]
pub struct PluginRuntimeContext {
    name: Arc<str>,
    registry: Arc<ServiceRegistry>,
    group: Arc<Mutex<DisposerGroup>>,
    settings: SettingsHandle,
    messenger: Arc<dyn Messenger>,
}

impl PluginRuntimeContext {
    pub(crate) fn new(
        name: &str,
        registry: Arc<ServiceRegistry>,
        group: Arc<Mutex<DisposerGroup>>,
        settings: SettingsHandle,
        messenger: Arc<dyn Messenger>,
    ) -> Self {
        Self {
            name: Arc::from(name),
            registry,
            group,
            settings,
            messenger,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn settings(&self) -> &SettingsHandle {
        &self.settings
    }

    pub fn logger(&self) -> PluginLogger {
        PluginLogger {
            plugin: Arc::clone(&self.name),
        }
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    /// Publish a service under this plugin's name.
    ///
    /// Revocation is registered automatically and runs at unload.
    pub fn provide(&self, service: &str, value: ServiceValue) -> Result<()> {
        self.registry.provide(&self.name, service, value)?;
        let registry = Arc::clone(&self.registry);
        let owner = Arc::clone(&self.name);
        let name = service.to_string();
        lock(&self.group).add(move || registry.revoke(&owner, &name));
        Ok(())
    }

    pub fn inject(&self, service: &str) -> Result<ServiceValue> {
        self.registry.inject(service)
    }

    pub fn inject_as<T: Send + Sync + 'static>(&self, service: &str) -> Result<Arc<T>> {
        self.registry.inject_as(service)
    }

    pub fn has(&self, service: &str) -> bool {
        self.registry.has(service)
    }

    /// Run a side effect now; its returned disposer runs at unload.
    pub fn effect(&self, f: impl FnOnce() -> Option<Disposer>) {
        if let Some(disposer) = f() {
            lock(&self.group).add(disposer);
        }
    }

    /// Register a callback to run when the plugin unloads.
    pub fn on_dispose(&self, f: impl FnOnce() + Send + 'static) {
        lock(&self.group).add(f);
    }

    /// Send a message to the attached UI or peer process.
    pub fn broadcast(&self, channel: &str, payload: Value) {
        self.messenger.broadcast(channel, payload);
    }
}

/// Look up a dotted path inside a JSON value.
pub(crate) fn deep_get<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Set a dotted path inside a JSON value, creating objects along the way.
pub(crate) fn deep_set(target: &mut Value, path: &str, value: Value) {
    if !target.is_object() {
        *target = Value::Object(Default::default());
    }
    let Some(map) = target.as_object_mut() else {
        return;
    };
    match path.split_once('.') {
        None => {
            map.insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            let next = map
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Default::default()));
            deep_set(next, rest, value);
        }
    }
}

/// Recursively merge `patch` into `target`. Non-object values replace.
pub(crate) fn deep_merge(target: &mut Value, patch: Value) {
    match (target, patch) {
        (Value::Object(target_map), Value::Object(patch_map)) => {
            for (key, patch_value) in patch_map {
                match target_map.get_mut(&key) {
                    Some(existing) => deep_merge(existing, patch_value),
                    None => {
                        target_map.insert(key, patch_value);
                    }
                }
            }
        }
        (target, patch) => *target = patch,
    }
}
