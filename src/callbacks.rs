//! Host event callbacks.

use crate::host::PluginListItem;
use crate::registry::ServiceEntry;

/// Observer notified as the host scans, loads and unloads plugins.
///
/// Embedders implement this to mirror plugin and service state into a UI
/// or peer process. All methods default to no-ops.
pub trait HostObserver: Send + Sync {
    /// Discovery finished; `plugins` is the post-merge record list.
    fn on_scan(&self, plugins: &[PluginListItem]) {
        let _ = plugins;
    }

    /// A plugin finished activating.
    fn on_plugin_loaded(&self, name: &str) {
        let _ = name;
    }

    /// Any plugin status, enabled flag or error changed.
    fn on_state_changed(&self, plugins: &[PluginListItem]) {
        let _ = plugins;
    }

    /// The shared registry's contents changed.
    fn on_services_changed(&self, services: &[ServiceEntry]) {
        let _ = services;
    }
}

/// Observer that ignores every event.
#[derive(Default)]
pub struct NullObserver;

impl HostObserver for NullObserver {}
