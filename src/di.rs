//! Per-plugin dependency injection container.
//!
//! A [`ServiceCollection`] records descriptors, [`ServiceCollection::build`]
//! freezes them into a root [`ServiceProvider`]. Scopes share the root's
//! singleton cache but keep their own scoped cache and cleanup stack.

use std::any::Any;
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{HostError, Result};
use crate::registry::ServiceRegistry;

/// Lock a mutex, recovering the guard if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// String key identifying a registration.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceToken(Cow<'static, str>);

impl ServiceToken {
    pub const fn from_static(name: &'static str) -> Self {
        Self(Cow::Borrowed(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServiceToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&'static str> for ServiceToken {
    fn from(name: &'static str) -> Self {
        Self(Cow::Borrowed(name))
    }
}

impl From<String> for ServiceToken {
    fn from(name: String) -> Self {
        Self(Cow::Owned(name))
    }
}

/// Instance caching policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifetime {
    /// One instance for the root provider and every scope.
    Singleton,
    /// One instance per scope; the root counts as its own scope.
    Scoped,
    /// A fresh instance on every resolution. Never cached, never cleaned up.
    Transient,
}

/// Cleanup attached to a resolved instance, run on provider disposal.
pub type Cleanup = Box<dyn FnOnce() + Send>;

/// A resolved service instance plus its optional cleanup.
pub struct ServiceInstance {
    value: Arc<dyn Any + Send + Sync>,
    cleanup: Option<Cleanup>,
}

impl ServiceInstance {
    pub fn new<T: Send + Sync + 'static>(value: T) -> Self {
        Self {
            value: Arc::new(value),
            cleanup: None,
        }
    }

    pub fn from_arc<T: Send + Sync + 'static>(value: Arc<T>) -> Self {
        Self {
            value,
            cleanup: None,
        }
    }

    pub fn with_cleanup(mut self, cleanup: impl FnOnce() + Send + 'static) -> Self {
        self.cleanup = Some(Box::new(cleanup));
        self
    }
}

/// Factory invoked at most once per cache slot for cached lifetimes.
pub type ServiceFactory =
    Arc<dyn Fn(&ServiceProvider) -> Result<ServiceInstance> + Send + Sync>;

#[derive(Clone)]
struct ServiceDescriptor {
    lifetime: Lifetime,
    factory: ServiceFactory,
}

/// Mutable registration phase of the container.
#[derive(Default)]
pub struct ServiceCollection {
    descriptors: HashMap<ServiceToken, ServiceDescriptor>,
    registry: Option<Arc<ServiceRegistry>>,
}

impl ServiceCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fall back to this shared registry for unregistered tokens.
    pub fn with_registry(mut self, registry: Arc<ServiceRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn add_singleton<F>(&mut self, token: impl Into<ServiceToken>, factory: F) -> Result<&mut Self>
    where
        F: Fn(&ServiceProvider) -> Result<ServiceInstance> + Send + Sync + 'static,
    {
        self.add(token.into(), Lifetime::Singleton, Arc::new(factory))
    }

    pub fn add_scoped<F>(&mut self, token: impl Into<ServiceToken>, factory: F) -> Result<&mut Self>
    where
        F: Fn(&ServiceProvider) -> Result<ServiceInstance> + Send + Sync + 'static,
    {
        self.add(token.into(), Lifetime::Scoped, Arc::new(factory))
    }

    pub fn add_transient<F>(&mut self, token: impl Into<ServiceToken>, factory: F) -> Result<&mut Self>
    where
        F: Fn(&ServiceProvider) -> Result<ServiceInstance> + Send + Sync + 'static,
    {
        self.add(token.into(), Lifetime::Transient, Arc::new(factory))
    }

    /// Register a singleton only when the token is still free.
    pub fn try_add_singleton<F>(&mut self, token: impl Into<ServiceToken>, factory: F) -> &mut Self
    where
        F: Fn(&ServiceProvider) -> Result<ServiceInstance> + Send + Sync + 'static,
    {
        let token = token.into();
        if !self.descriptors.contains_key(&token) {
            self.descriptors.insert(
                token,
                ServiceDescriptor {
                    lifetime: Lifetime::Singleton,
                    factory: Arc::new(factory),
                },
            );
        }
        self
    }

    /// Register an already constructed value as a singleton.
    pub fn add_value<T: Clone + Send + Sync + 'static>(
        &mut self,
        token: impl Into<ServiceToken>,
        value: T,
    ) -> Result<&mut Self> {
        self.add_singleton(token, move |_| Ok(ServiceInstance::new(value.clone())))
    }

    pub fn has(&self, token: &ServiceToken) -> bool {
        self.descriptors.contains_key(token)
    }

    fn add(
        &mut self,
        token: ServiceToken,
        lifetime: Lifetime,
        factory: ServiceFactory,
    ) -> Result<&mut Self> {
        if self.descriptors.contains_key(&token) {
            return Err(HostError::DuplicateService(token.to_string()));
        }
        self.descriptors
            .insert(token, ServiceDescriptor { lifetime, factory });
        Ok(self)
    }

    /// Freeze the collection into a root provider.
    pub fn build(self) -> ServiceProvider {
        ServiceProvider {
            descriptors: Arc::new(self.descriptors),
            singletons: Arc::new(Mutex::new(HashMap::new())),
            singleton_cleanup: Arc::new(Mutex::new(Vec::new())),
            scoped: Mutex::new(HashMap::new()),
            scoped_cleanup: Mutex::new(Vec::new()),
            registry: self.registry,
            is_scope: false,
        }
    }
}

/// Resolution phase of the container.
///
/// Scopes created with [`create_scope`](Self::create_scope) share singleton
/// state with the root but resolve scoped services independently.
pub struct ServiceProvider {
    descriptors: Arc<HashMap<ServiceToken, ServiceDescriptor>>,
    singletons: Arc<Mutex<HashMap<ServiceToken, Arc<dyn Any + Send + Sync>>>>,
    singleton_cleanup: Arc<Mutex<Vec<Cleanup>>>,
    scoped: Mutex<HashMap<ServiceToken, Arc<dyn Any + Send + Sync>>>,
    scoped_cleanup: Mutex<Vec<Cleanup>>,
    registry: Option<Arc<ServiceRegistry>>,
    is_scope: bool,
}

impl ServiceProvider {
    /// Resolve the value registered under `token`.
    ///
    /// Unknown tokens fall back to the shared registry when one was
    /// attached at collection time.
    pub fn get(&self, token: &ServiceToken) -> Result<Arc<dyn Any + Send + Sync>> {
        let Some(descriptor) = self.descriptors.get(token).cloned() else {
            if let Some(registry) = &self.registry {
                if let Ok(value) = registry.inject(token.as_str()) {
                    return Ok(value);
                }
            }
            return Err(HostError::NotRegistered(token.to_string()));
        };

        match descriptor.lifetime {
            Lifetime::Singleton => self.resolve_cached(
                token,
                &descriptor,
                &self.singletons,
                &self.singleton_cleanup,
            ),
            Lifetime::Scoped => {
                self.resolve_cached(token, &descriptor, &self.scoped, &self.scoped_cleanup)
            }
            Lifetime::Transient => {
                let instance = (descriptor.factory)(self)?;
                // transient cleanups are intentionally dropped
                Ok(instance.value)
            }
        }
    }

    /// Resolve and downcast to the registered concrete type.
    pub fn get_as<T: Send + Sync + 'static>(&self, token: &ServiceToken) -> Result<Arc<T>> {
        self.get(token)?
            .downcast::<T>()
            .map_err(|_| HostError::TypeMismatch(token.to_string()))
    }

    pub fn has(&self, token: &ServiceToken) -> bool {
        self.descriptors.contains_key(token)
    }

    /// Create a scope sharing singleton state with this provider.
    pub fn create_scope(&self) -> ServiceProvider {
        ServiceProvider {
            descriptors: Arc::clone(&self.descriptors),
            singletons: Arc::clone(&self.singletons),
            singleton_cleanup: Arc::clone(&self.singleton_cleanup),
            scoped: Mutex::new(HashMap::new()),
            scoped_cleanup: Mutex::new(Vec::new()),
            registry: self.registry.clone(),
            is_scope: true,
        }
    }

    /// Run cleanups and drop cached instances.
    ///
    /// The scope-level stack drains to completion before the singleton
    /// stack, each LIFO. A scope releases only its scoped state; the root
    /// also releases the singleton stack.
    pub fn dispose(&self) {
        let mut scoped_cleanups: Vec<Cleanup> = std::mem::take(&mut *lock(&self.scoped_cleanup));
        lock(&self.scoped).clear();
        while let Some(cleanup) = scoped_cleanups.pop() {
            cleanup();
        }

        if !self.is_scope {
            let mut singleton_cleanups: Vec<Cleanup> =
                std::mem::take(&mut *lock(&self.singleton_cleanup));
            lock(&self.singletons).clear();
            while let Some(cleanup) = singleton_cleanups.pop() {
                cleanup();
            }
        }
    }

    fn resolve_cached(
        &self,
        token: &ServiceToken,
        descriptor: &ServiceDescriptor,
        cache: &Mutex<HashMap<ServiceToken, Arc<dyn Any + Send + Sync>>>,
        cleanups: &Mutex<Vec<Cleanup>>,
    ) -> Result<Arc<dyn Any + Send + Sync>> {
        if let Some(cached) = lock(cache).get(token) {
            return Ok(Arc::clone(cached));
        }

        // The lock is released while the factory runs so factories can
        // resolve their own dependencies through this provider.
        let instance = (descriptor.factory)(self)?;

        let mut cache = lock(cache);
        if let Some(raced) = cache.get(token) {
            // A concurrent resolution won; keep the first instance.
            return Ok(Arc::clone(raced));
        }
        cache.insert(token.clone(), Arc::clone(&instance.value));
        drop(cache);

        if let Some(cleanup) = instance.cleanup {
            lock(cleanups).push(cleanup);
        }
        Ok(instance.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter_factory(
        counter: Arc<AtomicUsize>,
    ) -> impl Fn(&ServiceProvider) -> Result<ServiceInstance> + Send + Sync + 'static {
        move |_| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            Ok(ServiceInstance::new(n))
        }
    }

    #[test]
    fn singleton_resolves_once_and_is_shared_with_scopes() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut services = ServiceCollection::new();
        services
            .add_singleton("svc", counter_factory(counter.clone()))
            .unwrap();
        let provider = services.build();

        let a = provider.get_as::<usize>(&"svc".into()).unwrap();
        let scope = provider.create_scope();
        let b = scope.get_as::<usize>(&"svc".into()).unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn scoped_resolves_once_per_scope() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut services = ServiceCollection::new();
        services
            .add_scoped("svc", counter_factory(counter.clone()))
            .unwrap();
        let provider = services.build();

        let root_a = provider.get_as::<usize>(&"svc".into()).unwrap();
        let root_b = provider.get_as::<usize>(&"svc".into()).unwrap();
        assert!(Arc::ptr_eq(&root_a, &root_b));

        let scope = provider.create_scope();
        let scoped = scope.get_as::<usize>(&"svc".into()).unwrap();
        assert!(!Arc::ptr_eq(&root_a, &scoped));
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn transient_resolves_fresh_every_time() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut services = ServiceCollection::new();
        services
            .add_transient("svc", counter_factory(counter.clone()))
            .unwrap();
        let provider = services.build();

        let a = provider.get_as::<usize>(&"svc".into()).unwrap();
        let b = provider.get_as::<usize>(&"svc".into()).unwrap();

        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn duplicate_registration_fails() {
        let mut services = ServiceCollection::new();
        services.add_value("svc", 1u32).unwrap();
        let err = services.add_value("svc", 2u32).map(|_| ()).unwrap_err();
        assert!(matches!(err, HostError::DuplicateService(_)));

        // try_add silently keeps the first registration
        services.try_add_singleton("svc", |_| Ok(ServiceInstance::new(3u32)));
        let provider = services.build();
        assert_eq!(*provider.get_as::<u32>(&"svc".into()).unwrap(), 1);
    }

    #[test]
    fn factories_can_resolve_dependencies() {
        let mut services = ServiceCollection::new();
        services.add_value("base", 20u32).unwrap();
        services
            .add_singleton("derived", |provider| {
                let base = provider.get_as::<u32>(&"base".into())?;
                Ok(ServiceInstance::new(*base + 1))
            })
            .unwrap();
        let provider = services.build();

        assert_eq!(*provider.get_as::<u32>(&"derived".into()).unwrap(), 21);
    }

    #[test]
    fn dispose_runs_cleanups_lifo() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut services = ServiceCollection::new();
        for name in ["first", "second"] {
            let order = order.clone();
            services
                .add_singleton(name, move |_| {
                    let order = order.clone();
                    Ok(ServiceInstance::new(())
                        .with_cleanup(move || lock(&order).push(name)))
                })
                .unwrap();
        }
        let provider = services.build();
        provider.get(&"first".into()).unwrap();
        provider.get(&"second".into()).unwrap();

        provider.dispose();

        assert_eq!(*lock(&order), vec!["second", "first"]);
    }

    #[test]
    fn root_dispose_drains_scoped_before_singletons() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut services = ServiceCollection::new();
        {
            let order = order.clone();
            services
                .add_singleton("root", move |_| {
                    let order = order.clone();
                    Ok(ServiceInstance::new(())
                        .with_cleanup(move || lock(&order).push("singleton")))
                })
                .unwrap();
        }
        {
            let order = order.clone();
            services
                .add_scoped("per-scope", move |_| {
                    let order = order.clone();
                    Ok(ServiceInstance::new(())
                        .with_cleanup(move || lock(&order).push("scoped")))
                })
                .unwrap();
        }
        let provider = services.build();
        provider.get(&"root".into()).unwrap();
        provider.get(&"per-scope".into()).unwrap();

        provider.dispose();

        assert_eq!(*lock(&order), vec!["scoped", "singleton"]);
    }

    #[test]
    fn scope_dispose_keeps_singletons_alive() {
        let singleton_cleaned = Arc::new(AtomicUsize::new(0));
        let scoped_cleaned = Arc::new(AtomicUsize::new(0));

        let mut services = ServiceCollection::new();
        {
            let cleaned = singleton_cleaned.clone();
            services
                .add_singleton("root", move |_| {
                    let cleaned = cleaned.clone();
                    Ok(ServiceInstance::new(()).with_cleanup(move || {
                        cleaned.fetch_add(1, Ordering::SeqCst);
                    }))
                })
                .unwrap();
        }
        {
            let cleaned = scoped_cleaned.clone();
            services
                .add_scoped("scoped", move |_| {
                    let cleaned = cleaned.clone();
                    Ok(ServiceInstance::new(()).with_cleanup(move || {
                        cleaned.fetch_add(1, Ordering::SeqCst);
                    }))
                })
                .unwrap();
        }
        let provider = services.build();

        let scope = provider.create_scope();
        scope.get(&"root".into()).unwrap();
        scope.get(&"scoped".into()).unwrap();
        scope.dispose();

        assert_eq!(scoped_cleaned.load(Ordering::SeqCst), 1);
        assert_eq!(singleton_cleaned.load(Ordering::SeqCst), 0);

        provider.dispose();
        assert_eq!(singleton_cleaned.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unregistered_token_falls_back_to_registry() {
        let registry = Arc::new(ServiceRegistry::new());
        registry.provide("core", "shared", Arc::new(99u32)).unwrap();

        let provider = ServiceCollection::new()
            .with_registry(registry)
            .build();

        assert_eq!(*provider.get_as::<u32>(&"shared".into()).unwrap(), 99);
        assert!(matches!(
            provider.get(&"absent".into()),
            Err(HostError::NotRegistered(_))
        ));
    }
}
