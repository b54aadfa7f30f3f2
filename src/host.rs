//! Plugin lifecycle manager.
//!
//! Owns the record table, drives scan / load / unload transitions, and
//! broadcasts list snapshots to the attached observer after every mutating
//! operation.

use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde_json::json;

use crate::callbacks::{HostObserver, NullObserver};
use crate::config::PluginHostOptions;
use crate::context::{ConfigStore, Messenger, NullMessenger, PluginRuntimeContext, SettingsHandle};
use crate::di::lock;
use crate::disposable::{AsyncDisposer, DisposerGroup};
use crate::error::{HostError, PluginErrorCode, PluginErrorInfo, Result};
use crate::graph::{build_plugin_graph, GraphNode};
use crate::loader::{resolve_factory, CompositeModuleLoader, ModuleLoader, StaticModuleLoader};
use crate::manifest::{discover_plugins, resolve_manifest, EntryPoint, PluginManifest};
use crate::preferences::{MemoryPreferenceStore, PreferenceStore};
use crate::registry::{ServiceRegistry, ServiceValue};

/// Owner name used for services provided by the host process itself.
pub const CORE_OWNER: &str = "core";

/// Where a plugin sits in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginStatus {
    /// Enabled but not loaded.
    Idle,
    Loading,
    Active,
    Error,
    Disabled,
}

/// Runtime wrapper around one resolved manifest.
pub struct PluginRecord {
    name: String,
    manifest: Arc<PluginManifest>,
    status: PluginStatus,
    enabled: bool,
    error: Option<PluginErrorInfo>,
    group: Arc<Mutex<DisposerGroup>>,
    disposer: Option<AsyncDisposer>,
}

impl PluginRecord {
    fn new(manifest: PluginManifest, enabled: bool) -> Self {
        Self {
            name: manifest.name.clone(),
            manifest: Arc::new(manifest),
            status: if enabled {
                PluginStatus::Idle
            } else {
                PluginStatus::Disabled
            },
            enabled,
            error: None,
            group: Arc::new(Mutex::new(DisposerGroup::new())),
            disposer: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> PluginStatus {
        self.status
    }

    pub fn manifest(&self) -> &PluginManifest {
        &self.manifest
    }
}

/// Externally visible snapshot of one plugin.
#[derive(Debug, Clone, Serialize)]
pub struct PluginListItem {
    pub name: String,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub status: PluginStatus,
    pub enabled: bool,
    pub provides: Vec<String>,
    pub injects: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<PluginErrorInfo>,
    pub has_renderer_entry: bool,
}

/// The plugin lifecycle manager.
///
/// All operations are sequential; plugins are never loaded concurrently
/// with each other, so a provider is always active before a consumer
/// attempts injection.
pub struct PluginHost {
    options: PluginHostOptions,
    records: Vec<PluginRecord>,
    loader: Arc<dyn ModuleLoader>,
    registered_modules: Arc<StaticModuleLoader>,
    registry: Arc<ServiceRegistry>,
    preferences: Arc<dyn PreferenceStore>,
    configs: Arc<ConfigStore>,
    messenger: Arc<dyn Messenger>,
    observer: Arc<dyn HostObserver>,
}

impl PluginHost {
    pub fn new(options: PluginHostOptions) -> Self {
        let registered_modules = Arc::new(StaticModuleLoader::new());
        let preferences: Arc<dyn PreferenceStore> = Arc::new(MemoryPreferenceStore::new());
        Self {
            options,
            records: Vec::new(),
            loader: Arc::new(CompositeModuleLoader::new(Arc::clone(&registered_modules))),
            registered_modules,
            registry: Arc::new(ServiceRegistry::new()),
            configs: Arc::new(ConfigStore::new(Arc::clone(&preferences))),
            preferences,
            messenger: Arc::new(NullMessenger),
            observer: Arc::new(NullObserver),
        }
    }

    /// Replace the module loader. Mostly useful for embedders with custom
    /// module formats.
    pub fn with_loader(mut self, loader: Arc<dyn ModuleLoader>) -> Self {
        self.loader = loader;
        self
    }

    pub fn with_preferences(mut self, preferences: Arc<dyn PreferenceStore>) -> Self {
        self.configs = Arc::new(ConfigStore::new(Arc::clone(&preferences)));
        self.preferences = preferences;
        self
    }

    pub fn with_messenger(mut self, messenger: Arc<dyn Messenger>) -> Self {
        self.messenger = messenger;
        self
    }

    /// Attach an observer and mirror registry changes into it.
    pub fn with_observer(self, observer: Arc<dyn HostObserver>) -> Self {
        {
            let observer = Arc::clone(&observer);
            self.registry
                .set_observer(Box::new(move |services| observer.on_services_changed(services)));
        }
        Self { observer, ..self }
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    /// Table for in-process (`registered` format) entry modules.
    pub fn registered_modules(&self) -> &Arc<StaticModuleLoader> {
        &self.registered_modules
    }

    /// Publish a host-process service into the shared registry.
    pub fn provide_service(&self, name: &str, value: ServiceValue) -> Result<()> {
        self.registry.provide(CORE_OWNER, name, value)
    }

    /// Settings handle scoped to a plugin's namespace.
    pub fn plugin_settings(&self, name: &str) -> Result<SettingsHandle> {
        let record = self.record(name)?;
        Ok(SettingsHandle::new(
            &record.manifest.settings.namespace,
            Arc::clone(&self.configs),
        ))
    }

    /// Re-run discovery and merge results into the record table.
    ///
    /// Records whose manifest hash is unchanged keep their status, error
    /// and disposer; changed manifests restart at idle/disabled. Records
    /// for plugins that vanished from disk are dropped unless still
    /// loaded.
    pub fn scan(&mut self) {
        let discovered = discover_plugins(&self.options.plugin_directories);
        let mut merged: Vec<PluginRecord> = Vec::with_capacity(discovered.len());

        for manifest in discovered {
            let enabled = self
                .preferences
                .is_enabled(&manifest.name)
                .unwrap_or(manifest.enabled);

            let position = self.records.iter().position(|r| r.name == manifest.name);
            let existing = position.map(|i| self.records.remove(i));

            match existing {
                Some(mut record) if record.manifest.hash == manifest.hash => {
                    record.enabled = enabled;
                    if record.status == PluginStatus::Idle && !enabled {
                        record.status = PluginStatus::Disabled;
                    } else if record.status == PluginStatus::Disabled && enabled {
                        record.status = PluginStatus::Idle;
                    }
                    merged.push(record);
                }
                Some(old)
                    if matches!(old.status, PluginStatus::Active | PluginStatus::Loading) =>
                {
                    // Manifest changed while the old instance is live. The
                    // new record adopts its group and disposer so a later
                    // unload still tears the old instance down.
                    let mut record = PluginRecord::new(manifest, enabled);
                    record.status = old.status;
                    record.error = old.error;
                    record.group = old.group;
                    record.disposer = old.disposer;
                    merged.push(record);
                }
                _ => merged.push(PluginRecord::new(manifest, enabled)),
            }
        }

        // Plugins removed from disk stay tracked only while loaded.
        for leftover in self.records.drain(..) {
            if matches!(leftover.status, PluginStatus::Active | PluginStatus::Loading) {
                merged.push(leftover);
            }
        }

        self.records = merged;
        let snapshot = self.list();
        self.observer.on_scan(&snapshot);
        self.observer.on_state_changed(&snapshot);
    }

    /// Snapshot of every tracked plugin.
    pub fn list(&self) -> Vec<PluginListItem> {
        self.records
            .iter()
            .map(|record| PluginListItem {
                name: record.name.clone(),
                version: record.manifest.version.clone(),
                display_name: record.manifest.display_name.clone(),
                description: record.manifest.description.clone(),
                status: record.status,
                enabled: record.enabled,
                provides: record.manifest.services.provide.clone(),
                injects: record.manifest.services.inject.clone(),
                error: record.error.clone(),
                has_renderer_entry: record.manifest.targets.renderer.is_some(),
            })
            .collect()
    }

    /// Load every enabled plugin in dependency order.
    ///
    /// Missing services mark the affected plugin as errored without
    /// blocking the rest. Any cycle marks every member and aborts the
    /// whole pass. Two plugins providing the same service fail the call.
    pub async fn load_all(&mut self) -> Result<()> {
        let nodes: Vec<GraphNode> = self
            .records
            .iter()
            .filter(|r| r.enabled)
            .map(|r| {
                GraphNode::new(
                    r.name.clone(),
                    r.manifest.services.provide.clone(),
                    r.manifest.services.inject.clone(),
                )
            })
            .collect();

        let graph = build_plugin_graph(&nodes)?;

        for missing in &graph.missing_services {
            // Core services published by the host process satisfy
            // injections without appearing in the plugin graph.
            if self.registry.has(&missing.service) {
                continue;
            }
            tracing::warn!(
                plugin = %missing.plugin,
                service = %missing.service,
                "declared injection has no provider"
            );
            self.mark_error(
                &missing.plugin,
                PluginErrorInfo::new(
                    PluginErrorCode::MissingService,
                    format!("service {} has no provider", missing.service),
                )
                .with_details(json!({ "service": missing.service })),
            );
        }

        if !graph.cycles.is_empty() {
            for members in &graph.cycles {
                tracing::error!(?members, "dependency cycle, aborting load pass");
                for name in members.clone() {
                    self.mark_error(
                        &name,
                        PluginErrorInfo::new(
                            PluginErrorCode::Cycle,
                            "plugin participates in a dependency cycle",
                        )
                        .with_details(json!({ "members": members })),
                    );
                }
            }
            self.notify_state_changed();
            return Ok(());
        }

        for name in graph.order {
            let skip = self
                .record(&name)
                .map(|r| !r.enabled || r.status == PluginStatus::Error)
                .unwrap_or(true);
            if skip {
                continue;
            }
            self.load_plugin(&name).await?;
        }

        self.notify_state_changed();
        Ok(())
    }

    /// Load one plugin.
    ///
    /// Activation failures are recorded on the plugin, not returned; only
    /// an unknown name is an error to the caller.
    pub async fn load_plugin(&mut self, name: &str) -> Result<()> {
        let record = self.record(name)?;
        if matches!(record.status, PluginStatus::Active | PluginStatus::Disabled) {
            return Ok(());
        }

        let manifest = Arc::clone(&record.manifest);
        let Some(entry) = manifest.targets.main.clone() else {
            // Renderer-only or passive plugins are active by definition.
            self.set_status(name, PluginStatus::Active, None);
            self.notify_state_changed();
            return Ok(());
        };

        self.set_status(name, PluginStatus::Loading, None);

        let group = Arc::clone(&self.record(name)?.group);
        let context = PluginRuntimeContext::new(
            name,
            Arc::clone(&self.registry),
            Arc::clone(&group),
            SettingsHandle::new(&manifest.settings.namespace, Arc::clone(&self.configs)),
            Arc::clone(&self.messenger),
        );
        let config = self.configs.get(&manifest.settings.namespace);
        let loader = Arc::clone(&self.loader);

        let activation = async {
            let exports = loader.load(&entry).await?;
            let factory = resolve_factory(&exports)?;
            factory(context, config).await
        }
        .await;

        match activation {
            Ok(disposer) => {
                if let Some(record) = self.record_mut(name) {
                    record.disposer = disposer;
                    record.status = PluginStatus::Active;
                    record.error = None;
                }
                tracing::info!(plugin = %name, "plugin loaded");
                self.observer.on_plugin_loaded(name);
            }
            Err(error) => {
                tracing::error!(plugin = %name, %error, "plugin load failed");
                self.mark_error(
                    name,
                    PluginErrorInfo::new(PluginErrorCode::LoadFailed, error.to_string()),
                );
            }
        }

        self.notify_state_changed();
        Ok(())
    }

    /// Unload one plugin, releasing everything it registered.
    ///
    /// No-op unless the plugin is active, loading or errored. Disposer
    /// failures are logged, never rethrown.
    pub async fn unload_plugin(&mut self, name: &str) -> Result<()> {
        let record = self.record(name)?;
        if !matches!(
            record.status,
            PluginStatus::Active | PluginStatus::Loading | PluginStatus::Error
        ) {
            return Ok(());
        }

        self.registry.revoke_all(name);

        let group = Arc::clone(&record.group);
        let disposer = self.record_mut(name).and_then(|r| r.disposer.take());

        lock(&group).dispose_all();
        if let Some(disposer) = disposer {
            if let Err(error) = disposer().await {
                tracing::error!(plugin = %name, %error, "plugin disposer failed");
            }
        }

        if let Some(record) = self.record_mut(name) {
            record.error = None;
            record.status = if record.enabled {
                PluginStatus::Idle
            } else {
                PluginStatus::Disabled
            };
        }
        tracing::info!(plugin = %name, "plugin unloaded");

        self.notify_state_changed();
        Ok(())
    }

    /// Unload then load, sequentially.
    pub async fn reload_plugin(&mut self, name: &str) -> Result<()> {
        self.unload_plugin(name).await?;
        self.load_plugin(name).await
    }

    /// Flip a plugin's enabled flag, persist it, and load or unload
    /// accordingly.
    pub async fn set_enabled(&mut self, name: &str, enabled: bool) -> Result<()> {
        {
            let record = self.record_mut_or_err(name)?;
            record.enabled = enabled;
        }
        self.preferences.set_enabled(name, enabled)?;

        if enabled {
            if let Some(record) = self.record_mut(name) {
                if record.status == PluginStatus::Disabled {
                    record.status = PluginStatus::Idle;
                }
            }
            self.load_plugin(name).await?;
        } else {
            self.unload_plugin(name).await?;
            if let Some(record) = self.record_mut(name) {
                record.status = PluginStatus::Disabled;
            }
            self.notify_state_changed();
        }
        Ok(())
    }

    /// Unload every tracked plugin, one at a time.
    pub async fn shutdown(&mut self) {
        let names: Vec<String> = self.records.iter().map(|r| r.name.clone()).collect();
        for name in names {
            if let Err(error) = self.unload_plugin(&name).await {
                tracing::error!(plugin = %name, %error, "unload during shutdown failed");
            }
        }
    }

    /// Resolve a path inside a plugin's package directory.
    ///
    /// Absolute paths and parent-directory traversal are rejected.
    pub fn resolve_asset_path(&self, name: &str, relative: &str) -> Result<PathBuf> {
        let record = self.record(name)?;
        let path = Path::new(relative);
        let traversal = path.is_absolute()
            || path
                .components()
                .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)));
        if traversal {
            return Err(HostError::Other(format!("invalid asset path: {relative}")));
        }
        Ok(record.manifest.root_dir.join(path))
    }

    /// The plugin's renderer entry point, if it declares one.
    pub fn renderer_entry(&self, name: &str) -> Result<Option<EntryPoint>> {
        Ok(self.record(name)?.manifest.targets.renderer.clone())
    }

    /// Copy a validated package directory into the writable search root.
    ///
    /// The package must resolve to a manifest and every declared plugin
    /// dependency must already be installed. Ends with a re-scan.
    pub fn install_from_directory(&mut self, source: &Path) -> Result<String> {
        let Some(manifest) = resolve_manifest(source)? else {
            return Err(HostError::Manifest {
                dir: source.to_path_buf(),
                message: "directory is not a plugin package".to_string(),
            });
        };

        let missing: Vec<String> = manifest
            .dependencies
            .iter()
            .filter(|dep| !self.records.iter().any(|r| &r.name == *dep))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(HostError::MissingDependencies(missing));
        }

        let root = self
            .options
            .install_directory()
            .ok_or(HostError::NoPluginDirectory)?
            .clone();
        let target = root.join(&manifest.name);
        if target.exists() {
            std::fs::remove_dir_all(&target)?;
        }
        copy_dir_all(source, &target)?;
        tracing::info!(plugin = %manifest.name, target = %target.display(), "plugin installed");

        self.scan();
        Ok(manifest.name)
    }

    /// Unload dependents and the target, delete its files, and forget its
    /// preferences.
    ///
    /// Refuses to remove plugins outside the writable search root.
    pub async fn uninstall_plugin(&mut self, name: &str) -> Result<()> {
        let root = self
            .options
            .install_directory()
            .ok_or(HostError::NoPluginDirectory)?
            .clone();
        let record = self.record(name)?;
        if !record.manifest.root_dir.starts_with(&root) {
            return Err(HostError::NotRemovable(name.to_string()));
        }
        let root_dir = record.manifest.root_dir.clone();

        for dependent in self.collect_dependents(name) {
            self.unload_plugin(&dependent).await?;
        }
        self.unload_plugin(name).await?;

        std::fs::remove_dir_all(&root_dir)?;
        self.preferences.remove(name)?;
        self.records.retain(|r| r.name != name);
        tracing::info!(plugin = %name, "plugin uninstalled");

        self.notify_state_changed();
        Ok(())
    }

    /// Transitive consumers of the services `name` provides, depth first.
    fn collect_dependents(&self, name: &str) -> Vec<String> {
        let mut dependents = Vec::new();
        let mut stack = vec![name.to_string()];
        while let Some(current) = stack.pop() {
            let Some(provider) = self.records.iter().find(|r| r.name == current) else {
                continue;
            };
            for record in &self.records {
                let consumes = record
                    .manifest
                    .services
                    .inject
                    .iter()
                    .any(|s| provider.manifest.services.provide.contains(s));
                if consumes
                    && record.name != name
                    && !dependents.contains(&record.name)
                {
                    dependents.push(record.name.clone());
                    stack.push(record.name.clone());
                }
            }
        }
        dependents
    }

    fn record(&self, name: &str) -> Result<&PluginRecord> {
        self.records
            .iter()
            .find(|r| r.name == name)
            .ok_or_else(|| HostError::PluginNotFound(name.to_string()))
    }

    fn record_mut(&mut self, name: &str) -> Option<&mut PluginRecord> {
        self.records.iter_mut().find(|r| r.name == name)
    }

    fn record_mut_or_err(&mut self, name: &str) -> Result<&mut PluginRecord> {
        self.records
            .iter_mut()
            .find(|r| r.name == name)
            .ok_or_else(|| HostError::PluginNotFound(name.to_string()))
    }

    fn set_status(&mut self, name: &str, status: PluginStatus, error: Option<PluginErrorInfo>) {
        if let Some(record) = self.record_mut(name) {
            record.status = status;
            record.error = error;
        }
    }

    fn mark_error(&mut self, name: &str, error: PluginErrorInfo) {
        self.set_status(name, PluginStatus::Error, Some(error));
    }

    fn notify_state_changed(&self) {
        let snapshot = self.list();
        self.observer.on_state_changed(&snapshot);
    }
}

fn copy_dir_all(source: &Path, target: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(target)?;
    for entry in std::fs::read_dir(source)? {
        let entry = entry?;
        let dest = target.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_all(&entry.path(), &dest)?;
        } else {
            std::fs::copy(entry.path(), &dest)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    type Trace = Arc<Mutex<Vec<String>>>;

    fn write_plugin(root: &Path, name: &str, plugin_section: &str) -> PathBuf {
        let dir = root.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("package.json"),
            format!(
                r#"{{"name": "{name}", "version": "1.0.0", "plugin": {plugin_section}}}"#
            ),
        )
        .unwrap();
        dir
    }

    fn host_for(root: &Path) -> PluginHost {
        PluginHost::new(
            PluginHostOptions::new().plugin_directories([root.to_path_buf()]),
        )
    }

    fn register_tracing_factory(host: &PluginHost, dir: &Path, label: &'static str, trace: Trace) {
        host.registered_modules().register_factory(
            dir.join("main.plugin"),
            move |_context, _settings: Value| {
                let trace = trace.clone();
                async move {
                    lock(&trace).push(format!("{label}-load"));
                    let disposer: AsyncDisposer = Box::new(move || {
                        Box::pin(async move {
                            lock(&trace).push(format!("{label}-dispose"));
                            Ok(())
                        })
                    });
                    Ok(Some(disposer))
                }
            },
        );
    }

    fn status_of(host: &PluginHost, name: &str) -> PluginStatus {
        host.list()
            .into_iter()
            .find(|p| p.name == name)
            .unwrap()
            .status
    }

    fn error_code_of(host: &PluginHost, name: &str) -> Option<PluginErrorCode> {
        host.list()
            .into_iter()
            .find(|p| p.name == name)
            .unwrap()
            .error
            .map(|e| e.code)
    }

    #[tokio::test]
    async fn load_all_activates_providers_before_consumers() {
        let tmp = TempDir::new().unwrap();
        let provider_dir = write_plugin(
            tmp.path(),
            "provider",
            r#"{"targets": {"main": "main.plugin"}, "services": {"provide": ["store"]}}"#,
        );
        let consumer_dir = write_plugin(
            tmp.path(),
            "consumer",
            r#"{"targets": {"main": "main.plugin"}, "services": {"inject": ["store"]}}"#,
        );

        let mut host = host_for(tmp.path());
        let trace: Trace = Arc::new(Mutex::new(Vec::new()));

        {
            let trace = trace.clone();
            host.registered_modules().register_factory(
                provider_dir.join("main.plugin"),
                move |context, _settings: Value| {
                    let trace = trace.clone();
                    async move {
                        context.provide("store", Arc::new(10u32))?;
                        lock(&trace).push("provider".to_string());
                        Ok(None)
                    }
                },
            );
        }
        {
            let trace = trace.clone();
            host.registered_modules().register_factory(
                consumer_dir.join("main.plugin"),
                move |context, _settings: Value| {
                    let trace = trace.clone();
                    async move {
                        let store = context.inject_as::<u32>("store")?;
                        lock(&trace).push(format!("consumer-{store}"));
                        Ok(None)
                    }
                },
            );
        }

        host.scan();
        host.load_all().await.unwrap();

        assert_eq!(*lock(&trace), vec!["provider", "consumer-10"]);
        assert_eq!(status_of(&host, "provider"), PluginStatus::Active);
        assert_eq!(status_of(&host, "consumer"), PluginStatus::Active);
    }

    #[tokio::test]
    async fn missing_service_marks_error_without_blocking_the_rest() {
        let tmp = TempDir::new().unwrap();
        write_plugin(
            tmp.path(),
            "broken",
            r#"{"targets": {"main": "main.plugin"}, "services": {"inject": ["absent"]}}"#,
        );
        let ok_dir = write_plugin(
            tmp.path(),
            "healthy",
            r#"{"targets": {"main": "main.plugin"}}"#,
        );

        let mut host = host_for(tmp.path());
        let trace: Trace = Arc::new(Mutex::new(Vec::new()));
        register_tracing_factory(&host, &ok_dir, "healthy", trace.clone());

        host.scan();
        host.load_all().await.unwrap();

        assert_eq!(status_of(&host, "broken"), PluginStatus::Error);
        assert_eq!(
            error_code_of(&host, "broken"),
            Some(PluginErrorCode::MissingService)
        );
        assert_eq!(status_of(&host, "healthy"), PluginStatus::Active);
    }

    #[tokio::test]
    async fn cycle_aborts_the_whole_load_pass() {
        let tmp = TempDir::new().unwrap();
        write_plugin(
            tmp.path(),
            "alpha",
            r#"{"targets": {"main": "main.plugin"}, "services": {"provide": ["x"], "inject": ["y"]}}"#,
        );
        write_plugin(
            tmp.path(),
            "beta",
            r#"{"targets": {"main": "main.plugin"}, "services": {"provide": ["y"], "inject": ["x"]}}"#,
        );
        let solo_dir = write_plugin(
            tmp.path(),
            "solo",
            r#"{"targets": {"main": "main.plugin"}}"#,
        );

        let mut host = host_for(tmp.path());
        let trace: Trace = Arc::new(Mutex::new(Vec::new()));
        register_tracing_factory(&host, &solo_dir, "solo", trace.clone());

        host.scan();
        host.load_all().await.unwrap();

        assert_eq!(error_code_of(&host, "alpha"), Some(PluginErrorCode::Cycle));
        assert_eq!(error_code_of(&host, "beta"), Some(PluginErrorCode::Cycle));
        // the independent plugin is not loaded either
        assert_eq!(status_of(&host, "solo"), PluginStatus::Idle);
        assert!(lock(&trace).is_empty());
    }

    #[tokio::test]
    async fn duplicate_providers_fail_the_call() {
        let tmp = TempDir::new().unwrap();
        write_plugin(
            tmp.path(),
            "one",
            r#"{"services": {"provide": ["x"]}}"#,
        );
        write_plugin(
            tmp.path(),
            "two",
            r#"{"services": {"provide": ["x"]}}"#,
        );

        let mut host = host_for(tmp.path());
        host.scan();
        let err = host.load_all().await.unwrap_err();
        assert!(matches!(err, HostError::ServiceConflict { .. }));
    }

    #[tokio::test]
    async fn factory_failure_is_recorded_not_propagated() {
        let tmp = TempDir::new().unwrap();
        let dir = write_plugin(
            tmp.path(),
            "flaky",
            r#"{"targets": {"main": "main.plugin"}}"#,
        );

        let mut host = host_for(tmp.path());
        host.registered_modules().register_factory(
            dir.join("main.plugin"),
            |_context, _settings: Value| async {
                Err(HostError::Other("boot refused".into()))
            },
        );

        host.scan();
        host.load_all().await.unwrap();

        assert_eq!(status_of(&host, "flaky"), PluginStatus::Error);
        assert_eq!(
            error_code_of(&host, "flaky"),
            Some(PluginErrorCode::LoadFailed)
        );
    }

    #[tokio::test]
    async fn plugin_without_main_entry_is_passively_active() {
        let tmp = TempDir::new().unwrap();
        write_plugin(tmp.path(), "passive", r#"{}"#);

        let mut host = host_for(tmp.path());
        host.scan();
        host.load_all().await.unwrap();

        assert_eq!(status_of(&host, "passive"), PluginStatus::Active);
    }

    #[tokio::test]
    async fn unload_is_a_noop_when_idle_and_reload_restores_active() {
        let tmp = TempDir::new().unwrap();
        let dir = write_plugin(
            tmp.path(),
            "demo",
            r#"{"targets": {"main": "main.plugin"}}"#,
        );

        let mut host = host_for(tmp.path());
        let loads = Arc::new(AtomicUsize::new(0));
        {
            let loads = loads.clone();
            host.registered_modules().register_factory(
                dir.join("main.plugin"),
                move |_context, _settings: Value| {
                    let loads = loads.clone();
                    async move {
                        loads.fetch_add(1, Ordering::SeqCst);
                        Ok(None)
                    }
                },
            );
        }
        host.scan();

        host.unload_plugin("demo").await.unwrap();
        assert_eq!(status_of(&host, "demo"), PluginStatus::Idle);
        assert_eq!(loads.load(Ordering::SeqCst), 0);

        host.load_plugin("demo").await.unwrap();
        host.reload_plugin("demo").await.unwrap();

        assert_eq!(status_of(&host, "demo"), PluginStatus::Active);
        assert_eq!(loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unload_revokes_services_and_runs_disposers() {
        let tmp = TempDir::new().unwrap();
        let dir = write_plugin(
            tmp.path(),
            "demo",
            r#"{"targets": {"main": "main.plugin"}, "services": {"provide": ["svc"]}}"#,
        );

        let mut host = host_for(tmp.path());
        let trace: Trace = Arc::new(Mutex::new(Vec::new()));
        {
            let trace = trace.clone();
            host.registered_modules().register_factory(
                dir.join("main.plugin"),
                move |context, _settings: Value| {
                    let trace = trace.clone();
                    async move {
                        context.provide("svc", Arc::new(1u32))?;
                        let disposer: AsyncDisposer = Box::new(move || {
                            Box::pin(async move {
                                lock(&trace).push("disposed".to_string());
                                Ok(())
                            })
                        });
                        Ok(Some(disposer))
                    }
                },
            );
        }

        host.scan();
        host.load_all().await.unwrap();
        assert!(host.registry().has("svc"));

        host.unload_plugin("demo").await.unwrap();

        assert!(!host.registry().has("svc"));
        assert_eq!(*lock(&trace), vec!["disposed"]);
        assert_eq!(status_of(&host, "demo"), PluginStatus::Idle);
    }

    #[tokio::test]
    async fn set_enabled_drives_load_and_unload() {
        let tmp = TempDir::new().unwrap();
        let dir = write_plugin(
            tmp.path(),
            "demo",
            r#"{"targets": {"main": "main.plugin"}}"#,
        );

        let mut host = host_for(tmp.path());
        let trace: Trace = Arc::new(Mutex::new(Vec::new()));
        register_tracing_factory(&host, &dir, "demo", trace.clone());

        host.scan();
        host.load_all().await.unwrap();
        assert_eq!(status_of(&host, "demo"), PluginStatus::Active);

        host.set_enabled("demo", false).await.unwrap();
        assert_eq!(status_of(&host, "demo"), PluginStatus::Disabled);

        host.set_enabled("demo", true).await.unwrap();
        assert_eq!(status_of(&host, "demo"), PluginStatus::Active);
        assert_eq!(
            *lock(&trace),
            vec!["demo-load", "demo-dispose", "demo-load"]
        );

        // the preference survives for the next scan
        host.scan();
        assert!(host.list().iter().find(|p| p.name == "demo").unwrap().enabled);
    }

    #[tokio::test]
    async fn shutdown_unloads_everything() {
        let tmp = TempDir::new().unwrap();
        let a = write_plugin(tmp.path(), "a", r#"{"targets": {"main": "main.plugin"}}"#);
        let b = write_plugin(tmp.path(), "b", r#"{"targets": {"main": "main.plugin"}}"#);

        let mut host = host_for(tmp.path());
        let trace: Trace = Arc::new(Mutex::new(Vec::new()));
        register_tracing_factory(&host, &a, "a", trace.clone());
        register_tracing_factory(&host, &b, "b", trace.clone());

        host.scan();
        host.load_all().await.unwrap();
        host.shutdown().await;

        let final_trace = lock(&trace).clone();
        assert!(final_trace.contains(&"a-dispose".to_string()));
        assert!(final_trace.contains(&"b-dispose".to_string()));
        assert_eq!(status_of(&host, "a"), PluginStatus::Idle);
        assert_eq!(status_of(&host, "b"), PluginStatus::Idle);
    }

    #[tokio::test]
    async fn core_services_are_injectable_by_plugins() {
        let tmp = TempDir::new().unwrap();
        let dir = write_plugin(
            tmp.path(),
            "demo",
            r#"{"targets": {"main": "main.plugin"}, "services": {"inject": ["core.clock"]}}"#,
        );

        let mut host = host_for(tmp.path());
        host.provide_service("core.clock", Arc::new(123u64)).unwrap();

        let seen = Arc::new(AtomicUsize::new(0));
        {
            let seen = seen.clone();
            host.registered_modules().register_factory(
                dir.join("main.plugin"),
                move |context, _settings: Value| {
                    let seen = seen.clone();
                    async move {
                        let clock = context.inject_as::<u64>("core.clock")?;
                        seen.store(*clock as usize, Ordering::SeqCst);
                        Ok(None)
                    }
                },
            );
        }

        host.scan();
        host.load_all().await.unwrap();

        assert_eq!(seen.load(Ordering::SeqCst), 123);
        assert_eq!(status_of(&host, "demo"), PluginStatus::Active);
    }

    #[tokio::test]
    async fn asset_paths_reject_traversal() {
        let tmp = TempDir::new().unwrap();
        let dir = write_plugin(tmp.path(), "demo", r#"{}"#);

        let mut host = host_for(tmp.path());
        host.scan();

        let resolved = host.resolve_asset_path("demo", "assets/icon.png").unwrap();
        assert_eq!(resolved, dir.join("assets/icon.png"));

        assert!(host.resolve_asset_path("demo", "../escape.txt").is_err());
        assert!(host.resolve_asset_path("demo", "/etc/passwd").is_err());
        assert!(matches!(
            host.resolve_asset_path("ghost", "a.txt"),
            Err(HostError::PluginNotFound(_))
        ));
    }

    #[tokio::test]
    async fn install_and_uninstall_round_trip() {
        let plugins = TempDir::new().unwrap();
        let staging = TempDir::new().unwrap();
        let source = write_plugin(staging.path(), "incoming", r#"{}"#);

        let mut host = host_for(plugins.path());
        host.scan();

        let name = host.install_from_directory(&source).unwrap();
        assert_eq!(name, "incoming");
        assert!(plugins.path().join("incoming/package.json").exists());
        assert_eq!(status_of(&host, "incoming"), PluginStatus::Idle);

        host.uninstall_plugin("incoming").await.unwrap();
        assert!(!plugins.path().join("incoming").exists());
        assert!(host.list().iter().all(|p| p.name != "incoming"));
    }

    #[tokio::test]
    async fn install_refuses_missing_dependencies() {
        let plugins = TempDir::new().unwrap();
        let staging = TempDir::new().unwrap();
        let source = write_plugin(
            staging.path(),
            "needy",
            r#"{"dependencies": ["absent-base"]}"#,
        );

        let mut host = host_for(plugins.path());
        host.scan();

        assert!(matches!(
            host.install_from_directory(&source),
            Err(HostError::MissingDependencies(_))
        ));
    }

    #[tokio::test]
    async fn uninstall_unloads_dependents_first() {
        let tmp = TempDir::new().unwrap();
        let base_dir = write_plugin(
            tmp.path(),
            "base",
            r#"{"targets": {"main": "main.plugin"}, "services": {"provide": ["base.api"]}}"#,
        );
        let user_dir = write_plugin(
            tmp.path(),
            "user",
            r#"{"targets": {"main": "main.plugin"}, "services": {"inject": ["base.api"]}}"#,
        );

        let mut host = host_for(tmp.path());
        let trace: Trace = Arc::new(Mutex::new(Vec::new()));
        {
            let trace = trace.clone();
            host.registered_modules().register_factory(
                base_dir.join("main.plugin"),
                move |context, _settings: Value| {
                    let trace = trace.clone();
                    async move {
                        context.provide("base.api", Arc::new(0u8))?;
                        let disposer: AsyncDisposer = Box::new(move || {
                            Box::pin(async move {
                                lock(&trace).push("base-dispose".to_string());
                                Ok(())
                            })
                        });
                        Ok(Some(disposer))
                    }
                },
            );
        }
        register_tracing_factory(&host, &user_dir, "user", trace.clone());

        host.scan();
        host.load_all().await.unwrap();

        host.uninstall_plugin("base").await.unwrap();

        let final_trace = lock(&trace).clone();
        let user_pos = final_trace.iter().position(|e| e == "user-dispose").unwrap();
        let base_pos = final_trace.iter().position(|e| e == "base-dispose").unwrap();
        assert!(user_pos < base_pos);
        assert_eq!(status_of(&host, "user"), PluginStatus::Idle);
        assert!(host.list().iter().all(|p| p.name != "base"));
    }

    #[tokio::test]
    async fn scan_keeps_live_cleanups_across_manifest_changes() {
        let tmp = TempDir::new().unwrap();
        let dir = write_plugin(
            tmp.path(),
            "demo",
            r#"{"targets": {"main": "main.plugin"}, "services": {"provide": ["svc"]}}"#,
        );

        let mut host = host_for(tmp.path());
        let trace: Trace = Arc::new(Mutex::new(Vec::new()));
        {
            let trace = trace.clone();
            host.registered_modules().register_factory(
                dir.join("main.plugin"),
                move |context, _settings: Value| {
                    let trace = trace.clone();
                    async move {
                        context.provide("svc", Arc::new(1u32))?;
                        let disposer: AsyncDisposer = Box::new(move || {
                            Box::pin(async move {
                                lock(&trace).push("disposed".to_string());
                                Ok(())
                            })
                        });
                        Ok(Some(disposer))
                    }
                },
            );
        }

        host.scan();
        host.load_all().await.unwrap();
        assert_eq!(status_of(&host, "demo"), PluginStatus::Active);

        // rewrite the metadata so the hash changes while the plugin is live
        std::fs::write(
            dir.join("package.json"),
            r#"{"name": "demo", "version": "2.0.0", "plugin": {"targets": {"main": "main.plugin"}, "services": {"provide": ["svc"]}}}"#,
        )
        .unwrap();
        host.scan();

        // the live instance is still tracked with its resources
        assert_eq!(status_of(&host, "demo"), PluginStatus::Active);
        assert!(host.registry().has("svc"));

        host.shutdown().await;

        assert_eq!(*lock(&trace), vec!["disposed"]);
        assert!(!host.registry().has("svc"));
        assert_eq!(status_of(&host, "demo"), PluginStatus::Idle);
    }

    #[tokio::test]
    async fn scan_preserves_loaded_state_for_unchanged_manifests() {
        let tmp = TempDir::new().unwrap();
        let dir = write_plugin(
            tmp.path(),
            "demo",
            r#"{"targets": {"main": "main.plugin"}}"#,
        );

        let mut host = host_for(tmp.path());
        let trace: Trace = Arc::new(Mutex::new(Vec::new()));
        register_tracing_factory(&host, &dir, "demo", trace.clone());

        host.scan();
        host.load_all().await.unwrap();
        assert_eq!(status_of(&host, "demo"), PluginStatus::Active);

        host.scan();
        assert_eq!(status_of(&host, "demo"), PluginStatus::Active);
        assert_eq!(*lock(&trace), vec!["demo-load"]);
    }
}
