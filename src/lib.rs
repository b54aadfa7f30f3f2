//! Plugin host runtime.
//!
//! Discovers plugin packages on disk, orders them by their declared
//! service dependencies, and drives each through an idle / loading /
//! active / error / disabled lifecycle. Plugins talk to each other
//! through a shared [`ServiceRegistry`] and structure their own startup
//! with a per-plugin [`HostBuilder`] (DI container, middleware, hosted
//! services, exposures).
//!
//! ```no_run
//! use plugin_host::{PluginHost, PluginHostOptions};
//!
//! # async fn run() -> plugin_host::Result<()> {
//! let mut host = PluginHost::new(
//!     PluginHostOptions::new().add_plugin_directory("/opt/app/plugins"),
//! );
//! host.scan();
//! host.load_all().await?;
//! # Ok(())
//! # }
//! ```

pub mod callbacks;
pub mod config;
pub mod context;
pub mod di;
pub mod disposable;
pub mod error;
pub mod graph;
pub mod host;
pub mod hosting;
pub mod loader;
pub mod manifest;
pub mod preferences;
pub mod registry;

pub use callbacks::*;
pub use config::*;
pub use context::*;
pub use di::*;
pub use disposable::*;
pub use error::*;
pub use graph::*;
pub use host::*;
pub use hosting::*;
pub use loader::*;
pub use manifest::*;
pub use preferences::*;
pub use registry::*;
