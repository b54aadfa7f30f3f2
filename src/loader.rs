//! Entry module loading and factory resolution.
//!
//! A plugin's entry module exports a factory in one of several shapes;
//! [`resolve_factory`] normalizes them into a single callable. Native
//! libraries are loaded with `libloading`, registered modules come from an
//! in-process table.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::future::BoxFuture;
use libloading::Library;

use crate::context::PluginRuntimeContext;
use crate::di::lock;
use crate::disposable::AsyncDisposer;
use crate::error::{HostError, Result};
use crate::manifest::{EntryPoint, ModuleFormat};

/// What a plugin factory produces: an optional teardown callback.
pub type FactoryResult = Option<AsyncDisposer>;

/// The callable that activates a plugin.
pub type PluginFactory = Arc<
    dyn Fn(PluginRuntimeContext, serde_json::Value) -> BoxFuture<'static, Result<FactoryResult>>
        + Send
        + Sync,
>;

/// Wrap an async closure into a [`PluginFactory`].
pub fn plugin_factory<F, Fut>(f: F) -> PluginFactory
where
    F: Fn(PluginRuntimeContext, serde_json::Value) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<FactoryResult>> + Send + 'static,
{
    Arc::new(move |context, settings| Box::pin(f(context, settings)))
}

/// Everything an entry module can export.
///
/// Factories may sit at the module root, under a default export, or behind
/// an `apply` member on either. [`resolve_factory`] tries them in that
/// order.
pub enum ModuleExports {
    /// The module root itself is the factory.
    Factory(PluginFactory),
    /// The module root is a namespace of named exports.
    Namespace {
        default: Option<Box<ModuleExports>>,
        apply: Option<PluginFactory>,
    },
}

impl ModuleExports {
    pub fn factory(f: PluginFactory) -> Self {
        ModuleExports::Factory(f)
    }

    pub fn with_apply(f: PluginFactory) -> Self {
        ModuleExports::Namespace {
            default: None,
            apply: Some(f),
        }
    }

    pub fn with_default(inner: ModuleExports) -> Self {
        ModuleExports::Namespace {
            default: Some(Box::new(inner)),
            apply: None,
        }
    }
}

/// Pick the factory out of a module's exports.
///
/// Order: bare factory, default-export factory, root `apply`, then
/// `apply` under the default export.
pub fn resolve_factory(exports: &ModuleExports) -> Result<PluginFactory> {
    match exports {
        ModuleExports::Factory(f) => Ok(Arc::clone(f)),
        ModuleExports::Namespace { default, apply } => {
            if let Some(ModuleExports::Factory(f)) = default.as_deref() {
                return Ok(Arc::clone(f));
            }
            if let Some(f) = apply {
                return Ok(Arc::clone(f));
            }
            if let Some(ModuleExports::Namespace {
                apply: Some(f), ..
            }) = default.as_deref()
            {
                return Ok(Arc::clone(f));
            }
            Err(HostError::NoFactory)
        }
    }
}

/// Loads an entry point into its exports.
#[async_trait]
pub trait ModuleLoader: Send + Sync {
    async fn load(&self, entry: &EntryPoint) -> Result<ModuleExports>;
}

/// Symbol every native plugin library must export.
pub const ENTRY_SYMBOL: &[u8] = b"plugin_entry";

type EntryFn = unsafe extern "C" fn() -> *mut ModuleExports;

/// Loads native dynamic libraries.
///
/// Libraries stay open for the lifetime of the loader so factory code
/// remains mapped while plugins are active.
#[derive(Default)]
pub struct LibraryModuleLoader {
    libraries: Mutex<HashMap<PathBuf, Library>>,
}

impl LibraryModuleLoader {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ModuleLoader for LibraryModuleLoader {
    async fn load(&self, entry: &EntryPoint) -> Result<ModuleExports> {
        if entry.format != ModuleFormat::Native {
            return Err(HostError::LoadFailed(format!(
                "library loader cannot load {} entries",
                match entry.format {
                    ModuleFormat::Native => "native",
                    ModuleFormat::Registered => "registered",
                }
            )));
        }

        let mut libraries = lock(&self.libraries);
        if !libraries.contains_key(&entry.file) {
            let library = unsafe { Library::new(&entry.file) }
                .map_err(|e| HostError::LoadFailed(e.to_string()))?;
            libraries.insert(entry.file.clone(), library);
        }
        let library = libraries
            .get(&entry.file)
            .ok_or_else(|| HostError::LoadFailed(entry.file.display().to_string()))?;

        let exports = unsafe {
            let symbol = library.get::<EntryFn>(ENTRY_SYMBOL).map_err(|_| {
                HostError::SymbolNotFound(String::from_utf8_lossy(ENTRY_SYMBOL).into_owned())
            })?;
            let raw = symbol();
            if raw.is_null() {
                return Err(HostError::NoFactory);
            }
            *Box::from_raw(raw)
        };
        Ok(exports)
    }
}

type ExportsBuilder = Box<dyn Fn() -> ModuleExports + Send + Sync>;

/// In-process module table keyed by entry path.
///
/// Backs the `registered` module format and every test that does not want
/// to compile a real dynamic library.
#[derive(Default)]
pub struct StaticModuleLoader {
    modules: Mutex<HashMap<PathBuf, ExportsBuilder>>,
}

impl StaticModuleLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the exports produced for `path`.
    pub fn register(
        &self,
        path: impl Into<PathBuf>,
        builder: impl Fn() -> ModuleExports + Send + Sync + 'static,
    ) {
        lock(&self.modules).insert(path.into(), Box::new(builder));
    }

    /// Shortcut for registering a bare factory module.
    pub fn register_factory<F, Fut>(&self, path: impl Into<PathBuf>, f: F)
    where
        F: Fn(PluginRuntimeContext, serde_json::Value) -> Fut + Clone + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<FactoryResult>> + Send + 'static,
    {
        self.register(path, move || {
            ModuleExports::factory(plugin_factory(f.clone()))
        });
    }
}

#[async_trait]
impl ModuleLoader for StaticModuleLoader {
    async fn load(&self, entry: &EntryPoint) -> Result<ModuleExports> {
        let modules = lock(&self.modules);
        let builder = modules
            .get(&entry.file)
            .ok_or_else(|| HostError::LoadFailed(format!(
                "no registered module for {}",
                entry.file.display()
            )))?;
        Ok(builder())
    }
}

/// Route each entry format to the loader that understands it.
pub struct CompositeModuleLoader {
    native: LibraryModuleLoader,
    registered: Arc<StaticModuleLoader>,
}

impl CompositeModuleLoader {
    pub fn new(registered: Arc<StaticModuleLoader>) -> Self {
        Self {
            native: LibraryModuleLoader::new(),
            registered,
        }
    }
}

#[async_trait]
impl ModuleLoader for CompositeModuleLoader {
    async fn load(&self, entry: &EntryPoint) -> Result<ModuleExports> {
        match entry.format {
            ModuleFormat::Native => self.native.load(entry).await,
            ModuleFormat::Registered => self.registered.load(entry).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_factory() -> PluginFactory {
        plugin_factory(|_context, _settings| async { Ok(None) })
    }

    #[test]
    fn bare_factory_resolves() {
        let exports = ModuleExports::factory(noop_factory());
        assert!(resolve_factory(&exports).is_ok());
    }

    #[test]
    fn default_factory_resolves() {
        let exports = ModuleExports::with_default(ModuleExports::factory(noop_factory()));
        assert!(resolve_factory(&exports).is_ok());
    }

    #[test]
    fn apply_member_resolves() {
        let exports = ModuleExports::with_apply(noop_factory());
        assert!(resolve_factory(&exports).is_ok());
    }

    #[test]
    fn apply_under_default_resolves() {
        let exports = ModuleExports::with_default(ModuleExports::with_apply(noop_factory()));
        assert!(resolve_factory(&exports).is_ok());
    }

    #[test]
    fn empty_namespace_has_no_factory() {
        let exports = ModuleExports::Namespace {
            default: None,
            apply: None,
        };
        assert!(matches!(resolve_factory(&exports), Err(HostError::NoFactory)));
    }

    #[tokio::test]
    async fn static_loader_serves_registered_modules() {
        let loader = StaticModuleLoader::new();
        loader.register_factory("/plugins/demo/main.plugin", |_context, _settings| async {
            Ok(None)
        });

        let entry = EntryPoint {
            file: PathBuf::from("/plugins/demo/main.plugin"),
            format: ModuleFormat::Registered,
        };
        let exports = loader.load(&entry).await.unwrap();
        assert!(resolve_factory(&exports).is_ok());

        let unknown = EntryPoint {
            file: PathBuf::from("/plugins/other/main.plugin"),
            format: ModuleFormat::Registered,
        };
        assert!(matches!(
            loader.load(&unknown).await,
            Err(HostError::LoadFailed(_))
        ));
    }
}
