//! Application hosting layer for plugins.
//!
//! A [`HostBuilder`] accumulates service registrations, middleware, hosted
//! services and exposures, then freezes into a host application. Starting
//! the application runs configure delegates, drives the middleware chain
//! around hosted-service bootstrap, and publishes exposures to the shared
//! registry.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;

use crate::context::PluginRuntimeContext;
use crate::di::{lock, ServiceCollection, ServiceInstance, ServiceProvider, ServiceToken};
use crate::disposable::AsyncDisposer;
use crate::error::{HostError, Result};
use crate::loader::{plugin_factory, PluginFactory};
use crate::registry::{ServiceGuard, ServiceValue};

/// Well-known DI tokens pre-seeded into every plugin's collection.
pub mod tokens {
    use crate::di::ServiceToken;

    pub const RUNTIME_CONTEXT: ServiceToken = ServiceToken::from_static("host.runtime-context");
    pub const LOGGER: ServiceToken = ServiceToken::from_static("host.logger");
    pub const SETTINGS: ServiceToken = ServiceToken::from_static("host.settings");
    pub const LIFETIME: ServiceToken = ServiceToken::from_static("host.lifetime");
}

type LifetimeHook = Box<dyn Fn() -> Result<()> + Send + Sync>;

/// Lifecycle notification points for one host application.
///
/// Hook failures are logged and never abort the transition that fired
/// them.
#[derive(Default)]
pub struct HostLifetime {
    started: Mutex<Vec<LifetimeHook>>,
    stopping: Mutex<Vec<LifetimeHook>>,
    stopped: Mutex<Vec<LifetimeHook>>,
}

impl HostLifetime {
    pub fn on_started(&self, hook: impl Fn() -> Result<()> + Send + Sync + 'static) {
        lock(&self.started).push(Box::new(hook));
    }

    pub fn on_stopping(&self, hook: impl Fn() -> Result<()> + Send + Sync + 'static) {
        lock(&self.stopping).push(Box::new(hook));
    }

    pub fn on_stopped(&self, hook: impl Fn() -> Result<()> + Send + Sync + 'static) {
        lock(&self.stopped).push(Box::new(hook));
    }

    fn notify(&self, hooks: &Mutex<Vec<LifetimeHook>>, phase: &str) {
        for hook in lock(hooks).iter() {
            if let Err(error) = hook() {
                tracing::error!(%error, phase, "lifetime hook failed");
            }
        }
    }

    pub(crate) fn notify_started(&self) {
        self.notify(&self.started, "started");
    }

    pub(crate) fn notify_stopping(&self) {
        self.notify(&self.stopping, "stopping");
    }

    pub(crate) fn notify_stopped(&self) {
        self.notify(&self.stopped, "stopped");
    }
}

/// Environment and properties frozen at build time.
pub struct HostBuilderContext {
    pub environment: String,
    pub properties: HashMap<String, Value>,
    pub lifetime: Arc<HostLifetime>,
}

impl HostBuilderContext {
    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }
}

/// Everything available to middleware, configure delegates and hosted
/// services at runtime.
#[derive(Clone)]
pub struct AppContext {
    pub runtime: PluginRuntimeContext,
    pub services: Arc<ServiceProvider>,
    pub host: Arc<HostBuilderContext>,
}

/// Continuation handed to middleware; calling it runs the rest of the
/// chain.
pub type Next<'a> = Box<dyn FnOnce() -> BoxFuture<'a, Result<()>> + Send + 'a>;

/// Startup middleware. Each layer decides whether and when to run the rest
/// of the chain via `next`.
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn handle(&self, context: &AppContext, next: Next<'_>) -> Result<()>;
}

/// Long-running component owned by a host application.
///
/// Started in registration order inside the middleware chain, stopped in
/// reverse order.
#[async_trait]
pub trait HostedService: Send + Sync {
    fn name(&self) -> &str {
        "hosted-service"
    }

    async fn start(&self, context: &AppContext) -> Result<()>;

    async fn stop(&self) -> Result<()> {
        Ok(())
    }
}

type ConfigureServices = Box<dyn FnOnce(&mut ServiceCollection) -> Result<()> + Send>;
type ConfigureApp = Box<dyn FnOnce(AppContext) -> BoxFuture<'static, Result<()>> + Send>;
type ExposureResolver = Box<dyn Fn(&ServiceProvider) -> Result<ServiceValue> + Send + Sync>;

struct HostExposure {
    service: String,
    resolve: ExposureResolver,
}

/// Fluent builder for a plugin's host application.
pub struct HostBuilder {
    runtime: PluginRuntimeContext,
    environment: String,
    properties: HashMap<String, Value>,
    services: ServiceCollection,
    configure_services: Vec<ConfigureServices>,
    configures: Vec<ConfigureApp>,
    middleware: Vec<Arc<dyn Middleware>>,
    hosted: Vec<ServiceToken>,
    exposures: Vec<HostExposure>,
    lifetime: Arc<HostLifetime>,
}

impl HostBuilder {
    /// Create a builder pre-seeded with the runtime context, logger,
    /// settings handle and lifetime under their well-known tokens.
    pub fn new(runtime: PluginRuntimeContext) -> Self {
        let lifetime = Arc::new(HostLifetime::default());
        let mut services =
            ServiceCollection::new().with_registry(Arc::clone(runtime.registry()));

        {
            let runtime = runtime.clone();
            services.try_add_singleton(tokens::RUNTIME_CONTEXT, move |_| {
                Ok(ServiceInstance::new(runtime.clone()))
            });
        }
        {
            let logger = runtime.logger();
            services.try_add_singleton(tokens::LOGGER, move |_| {
                Ok(ServiceInstance::new(logger.clone()))
            });
        }
        {
            let settings = runtime.settings().clone();
            services.try_add_singleton(tokens::SETTINGS, move |_| {
                Ok(ServiceInstance::new(settings.clone()))
            });
        }
        {
            let lifetime = Arc::clone(&lifetime);
            services.try_add_singleton(tokens::LIFETIME, move |_| {
                Ok(ServiceInstance::from_arc(lifetime.clone()))
            });
        }

        Self {
            runtime,
            environment: "production".to_string(),
            properties: HashMap::new(),
            services,
            configure_services: Vec::new(),
            configures: Vec::new(),
            middleware: Vec::new(),
            hosted: Vec::new(),
            exposures: Vec::new(),
            lifetime,
        }
    }

    pub fn environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = environment.into();
        self
    }

    pub fn property(mut self, key: impl Into<String>, value: Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }

    pub fn lifetime(&self) -> &Arc<HostLifetime> {
        &self.lifetime
    }

    /// Queue a service registration delegate, run at build time.
    pub fn configure_services<F>(mut self, f: F) -> Self
    where
        F: FnOnce(&mut ServiceCollection) -> Result<()> + Send + 'static,
    {
        self.configure_services.push(Box::new(f));
        self
    }

    /// Queue an async configure delegate, run when the application starts.
    pub fn configure<F, Fut>(mut self, f: F) -> Self
    where
        F: FnOnce(AppContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.configures.push(Box::new(move |context| Box::pin(f(context))));
        self
    }

    /// Append a middleware layer around application startup.
    pub fn wrap(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middleware.push(middleware);
        self
    }

    /// Register a hosted service as a singleton under `token`.
    pub fn add_hosted_service<F>(
        mut self,
        token: impl Into<ServiceToken>,
        factory: F,
    ) -> Result<Self>
    where
        F: Fn(&ServiceProvider) -> Result<Arc<dyn HostedService>> + Send + Sync + 'static,
    {
        let token = token.into();
        self.services
            .add_singleton(token.clone(), move |provider| {
                Ok(ServiceInstance::new(factory(provider)?))
            })?;
        self.hosted.push(token);
        Ok(self)
    }

    /// Expose the value behind a DI token to the shared registry under
    /// `service` when the application starts.
    pub fn expose(self, service: impl Into<String>, token: impl Into<ServiceToken>) -> Self {
        let token = token.into();
        self.expose_with(service, move |provider| provider.get(&token))
    }

    /// Expose a value computed from the provider at start time.
    pub fn expose_with<F>(mut self, service: impl Into<String>, resolve: F) -> Self
    where
        F: Fn(&ServiceProvider) -> Result<ServiceValue> + Send + Sync + 'static,
    {
        self.exposures.push(HostExposure {
            service: service.into(),
            resolve: Box::new(resolve),
        });
        self
    }

    /// Run the queued service delegates and freeze the application.
    pub fn build(mut self) -> Result<ExposedHostApplication> {
        for configure in self.configure_services {
            configure(&mut self.services)?;
        }

        let host = Arc::new(HostBuilderContext {
            environment: self.environment,
            properties: self.properties,
            lifetime: Arc::clone(&self.lifetime),
        });
        let context = AppContext {
            runtime: self.runtime.clone(),
            services: Arc::new(self.services.build()),
            host,
        };

        Ok(ExposedHostApplication {
            inner: HostApplication {
                context,
                middleware: self.middleware,
                configures: Mutex::new(self.configures),
                hosted: self.hosted,
                running: Mutex::new(Vec::new()),
                started: AtomicBool::new(false),
                failed: AtomicBool::new(false),
                lifetime: self.lifetime,
            },
            runtime: self.runtime,
            exposures: self.exposures,
            guards: Mutex::new(Vec::new()),
        })
    }
}

fn dispatch<'a>(
    middleware: &'a [Arc<dyn Middleware>],
    context: &'a AppContext,
    terminal: Next<'a>,
) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        match middleware.split_first() {
            None => terminal().await,
            Some((head, rest)) => {
                let next: Next<'a> = Box::new(move || dispatch(rest, context, terminal));
                head.handle(context, next).await
            }
        }
    })
}

/// A built application: middleware chain, hosted services and lifetime.
pub struct HostApplication {
    context: AppContext,
    middleware: Vec<Arc<dyn Middleware>>,
    configures: Mutex<Vec<ConfigureApp>>,
    hosted: Vec<ServiceToken>,
    running: Mutex<Vec<Arc<dyn HostedService>>>,
    started: AtomicBool,
    failed: AtomicBool,
    lifetime: Arc<HostLifetime>,
}

impl HostApplication {
    pub fn context(&self) -> &AppContext {
        &self.context
    }

    /// Start the application. Calling again after a successful start is a
    /// no-op.
    ///
    /// The configure delegates run at most once; a failed start leaves
    /// the application unstartable, and later calls fail explicitly
    /// instead of re-running a partial startup.
    pub async fn start(&self) -> Result<()> {
        if self.started.load(Ordering::SeqCst) {
            return Ok(());
        }
        if self.failed.load(Ordering::SeqCst) {
            return Err(HostError::Other(
                "host application failed during a previous start and cannot be restarted"
                    .to_string(),
            ));
        }

        let configures: Vec<ConfigureApp> = std::mem::take(&mut *lock(&self.configures));
        for configure in configures {
            if let Err(error) = configure(self.context.clone()).await {
                self.failed.store(true, Ordering::SeqCst);
                return Err(error);
            }
        }

        // Hosted services bootstrap at the center of the onion so every
        // middleware observes them starting.
        let terminal: Next<'_> = Box::new(move || {
            Box::pin(async move {
                for token in &self.hosted {
                    let service: Arc<dyn HostedService> = self
                        .context
                        .services
                        .get_as::<Arc<dyn HostedService>>(token)
                        .map(|handle| (*handle).clone())?;
                    tracing::debug!(service = service.name(), "starting hosted service");
                    service.start(&self.context).await?;
                    lock(&self.running).push(service);
                }
                Ok(())
            })
        });
        if let Err(error) = dispatch(&self.middleware, &self.context, terminal).await {
            self.failed.store(true, Ordering::SeqCst);
            return Err(error);
        }

        self.started.store(true, Ordering::SeqCst);
        self.lifetime.notify_started();
        Ok(())
    }

    /// Stop hosted services in reverse start order.
    ///
    /// Individual stop failures are logged so later services still stop.
    pub async fn stop(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }
        self.lifetime.notify_stopping();

        loop {
            let Some(service) = lock(&self.running).pop() else {
                break;
            };
            if let Err(error) = service.stop().await {
                tracing::error!(service = service.name(), %error, "hosted service stop failed");
            }
        }

        self.lifetime.notify_stopped();
    }

    /// Stop, then release the container's cached instances.
    pub async fn dispose(&self) {
        self.stop().await;
        self.context.services.dispose();
    }
}

impl std::ops::Deref for ExposedHostApplication {
    type Target = HostApplication;

    fn deref(&self) -> &HostApplication {
        &self.inner
    }
}

/// A host application plus its registry exposures.
///
/// Exposures are registered before the inner application starts and rolled
/// back as a unit when any part of startup fails.
pub struct ExposedHostApplication {
    inner: HostApplication,
    runtime: PluginRuntimeContext,
    exposures: Vec<HostExposure>,
    guards: Mutex<Vec<ServiceGuard>>,
}

impl ExposedHostApplication {
    pub async fn start(&self) -> Result<()> {
        if self.inner.started.load(Ordering::SeqCst) {
            return Ok(());
        }

        for exposure in &self.exposures {
            let registered = (exposure.resolve)(&self.inner.context.services)
                .and_then(|value| {
                    self.runtime.registry().provide_guarded(
                        self.runtime.name(),
                        &exposure.service,
                        value,
                    )
                });
            match registered {
                Ok(guard) => lock(&self.guards).push(guard),
                Err(error) => {
                    self.revoke_exposures();
                    return Err(error);
                }
            }
        }

        if let Err(error) = self.inner.start().await {
            self.revoke_exposures();
            return Err(error);
        }
        Ok(())
    }

    pub async fn stop(&self) {
        self.inner.stop().await;
        self.revoke_exposures();
    }

    pub async fn dispose(&self) {
        self.stop().await;
        self.inner.context.services.dispose();
    }

    fn revoke_exposures(&self) {
        let guards: Vec<ServiceGuard> = std::mem::take(&mut *lock(&self.guards));
        for guard in guards {
            guard.revoke();
        }
    }
}

/// Build a plugin factory around a host application.
///
/// The setup closure shapes the builder; the returned factory builds and
/// starts the application and hands back a disposer that tears it down.
pub fn define_plugin<F, Fut>(setup: F) -> PluginFactory
where
    F: Fn(HostBuilder, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<HostBuilder>> + Send + 'static,
{
    plugin_factory(move |context, settings| {
        let setup_fut = setup(HostBuilder::new(context), settings);
        async move {
            let app = Arc::new(setup_fut.await?.build()?);
            app.start().await?;

            let handle = Arc::clone(&app);
            let disposer: AsyncDisposer = Box::new(move || {
                Box::pin(async move {
                    handle.dispose().await;
                    Ok(())
                })
            });
            Ok(Some(disposer))
        }
    })
}
