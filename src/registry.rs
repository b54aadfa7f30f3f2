//! Shared service registry for inter-plugin communication.
//!
//! A single authoritative mapping from service name to (owning plugin,
//! value). One owner per name: providing a name already owned by a
//! different plugin is a conflict, re-providing under the same owner is an
//! overwrite.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::Serialize;

use crate::error::{HostError, Result};

/// A value published on the shared bus.
pub type ServiceValue = Arc<dyn Any + Send + Sync>;

/// Callback fired after every registry mutation with a fresh snapshot.
/// Must never fail into the mutating caller; the signature enforces that.
pub type ChangeObserver = Box<dyn Fn(&[ServiceEntry]) + Send + Sync>;

/// Introspection record: values are deliberately omitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceEntry {
    pub name: String,
    pub owner: String,
}

struct Provider {
    owner: String,
    value: ServiceValue,
}

/// Host-wide service bus. Constructed explicitly and passed around as
/// `Arc<ServiceRegistry>` so tests can run isolated instances.
#[derive(Default)]
pub struct ServiceRegistry {
    entries: RwLock<HashMap<String, Provider>>,
    on_change: RwLock<Option<ChangeObserver>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the change observer notified after every mutation.
    pub fn set_observer(&self, observer: ChangeObserver) {
        if let Ok(mut slot) = self.on_change.write() {
            *slot = Some(observer);
        }
    }

    /// Register `value` under `name` for `owner`.
    ///
    /// Fails if the name is owned by a different plugin. Re-providing under
    /// the same owner overwrites the previous value.
    pub fn provide(&self, owner: &str, name: &str, value: ServiceValue) -> Result<()> {
        {
            let mut entries = self.write_entries();
            if let Some(existing) = entries.get(name) {
                if existing.owner != owner {
                    return Err(HostError::ProvideConflict {
                        service: name.to_string(),
                        owner: existing.owner.clone(),
                    });
                }
            }
            entries.insert(
                name.to_string(),
                Provider {
                    owner: owner.to_string(),
                    value,
                },
            );
        }
        tracing::debug!(service = name, owner, "service provided");
        self.notify_changed();
        Ok(())
    }

    /// Register a value and return a guard that revokes it.
    pub fn provide_guarded(
        self: &Arc<Self>,
        owner: &str,
        name: &str,
        value: ServiceValue,
    ) -> Result<ServiceGuard> {
        self.provide(owner, name, value)?;
        Ok(ServiceGuard {
            registry: Arc::clone(self),
            owner: owner.to_string(),
            name: name.to_string(),
        })
    }

    /// Fetch the value registered under `name`.
    pub fn inject(&self, name: &str) -> Result<ServiceValue> {
        self.read_entries()
            .get(name)
            .map(|p| Arc::clone(&p.value))
            .ok_or_else(|| HostError::ServiceNotAvailable(name.to_string()))
    }

    /// Fetch and downcast the value registered under `name`.
    pub fn inject_as<T: Send + Sync + 'static>(&self, name: &str) -> Result<Arc<T>> {
        self.inject(name)?
            .downcast::<T>()
            .map_err(|_| HostError::TypeMismatch(name.to_string()))
    }

    pub fn has(&self, name: &str) -> bool {
        self.read_entries().contains_key(name)
    }

    /// Remove one entry if it is owned by `owner`.
    pub fn revoke(&self, owner: &str, name: &str) {
        let removed = {
            let mut entries = self.write_entries();
            match entries.get(name) {
                Some(provider) if provider.owner == owner => {
                    entries.remove(name);
                    true
                }
                _ => false,
            }
        };
        if removed {
            tracing::debug!(service = name, owner, "service revoked");
            self.notify_changed();
        }
    }

    /// Remove every entry owned by `owner`.
    pub fn revoke_all(&self, owner: &str) {
        let removed: Vec<String> = {
            let mut entries = self.write_entries();
            let names: Vec<String> = entries
                .iter()
                .filter(|(_, p)| p.owner == owner)
                .map(|(name, _)| name.clone())
                .collect();
            for name in &names {
                entries.remove(name);
            }
            names
        };
        if !removed.is_empty() {
            tracing::debug!(owner, count = removed.len(), "services revoked");
            self.notify_changed();
        }
    }

    /// (name, owner) pairs for introspection and UI broadcast.
    pub fn snapshot(&self) -> Vec<ServiceEntry> {
        let mut list: Vec<ServiceEntry> = self
            .read_entries()
            .iter()
            .map(|(name, p)| ServiceEntry {
                name: name.clone(),
                owner: p.owner.clone(),
            })
            .collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }

    pub fn len(&self) -> usize {
        self.read_entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn notify_changed(&self) {
        let snapshot = self.snapshot();
        if let Ok(slot) = self.on_change.read() {
            if let Some(observer) = slot.as_ref() {
                observer(&snapshot);
            }
        }
    }

    fn read_entries(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Provider>> {
        self.entries.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_entries(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Provider>> {
        self.entries.write().unwrap_or_else(|e| e.into_inner())
    }
}

/// Revocation handle returned by [`ServiceRegistry::provide_guarded`].
pub struct ServiceGuard {
    registry: Arc<ServiceRegistry>,
    owner: String,
    name: String,
}

impl ServiceGuard {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Remove the entry this guard protects.
    pub fn revoke(self) {
        self.registry.revoke(&self.owner, &self.name);
    }
}
