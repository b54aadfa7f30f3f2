//! Cleanup callbacks tied to a plugin's active lifetime.

use futures::future::BoxFuture;

/// A synchronous cleanup callback.
pub type Disposer = Box<dyn FnOnce() + Send>;

/// An asynchronous cleanup callback returned by a plugin factory.
///
/// Failures are logged by the host, never rethrown.
pub type AsyncDisposer =
    Box<dyn FnOnce() -> BoxFuture<'static, crate::error::Result<()>> + Send>;

/// A LIFO stack of cleanup callbacks.
///
/// Everything a plugin registers while active (exposed services, effects,
/// message channels) lands here and is released in reverse registration
/// order when the plugin unloads.
#[derive(Default)]
pub struct DisposerGroup {
    stack: Vec<Disposer>,
}

impl DisposerGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a cleanup callback. It runs when the group is disposed.
    pub fn add(&mut self, disposer: impl FnOnce() + Send + 'static) {
        self.stack.push(Box::new(disposer));
    }

    pub fn len(&self) -> usize {
        self.stack.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }

    /// Run every callback, most recently registered first.
    pub fn dispose_all(&mut self) {
        while let Some(disposer) = self.stack.pop() {
            disposer();
        }
    }
}
