//! Error types for the plugin host runtime.

use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

/// Errors that can occur during plugin host operations.
#[derive(Debug, Error)]
pub enum HostError {
    /// Plugin not found
    #[error("Plugin not found: {0}")]
    PluginNotFound(String),

    /// Package metadata exists but is malformed
    #[error("Manifest error in {dir}: {message}")]
    Manifest { dir: PathBuf, message: String },

    /// Plugin entry has an unsupported file extension
    #[error("Unsupported plugin entry extension: {0}")]
    UnsupportedEntry(String),

    /// Two plugins declare the same provided service
    #[error("Service conflict: {service} provided by both {first} and {second}")]
    ServiceConflict {
        service: String,
        first: String,
        second: String,
    },

    /// Shared registry entry is already owned by another plugin
    #[error("Service {service} is already provided by {owner}")]
    ProvideConflict { service: String, owner: String },

    /// Shared registry has no entry under this name
    #[error("Service {0} is not available")]
    ServiceNotAvailable(String),

    /// DI token has no descriptor and no registry fallback
    #[error("Service not registered for token: {0}")]
    NotRegistered(String),

    /// DI token registered twice in one collection
    #[error("Service already registered for token: {0}")]
    DuplicateService(String),

    /// DI value exists but has a different concrete type
    #[error("Service registered for token {0} has an unexpected type")]
    TypeMismatch(String),

    /// Entry module does not export a recognizable factory
    #[error("Plugin entry does not export a factory function")]
    NoFactory,

    /// Failed to load or initialize a plugin module
    #[error("Failed to load plugin: {0}")]
    LoadFailed(String),

    /// Plugin entry symbol not found in a native library
    #[error("Plugin entry symbol not found: {0}")]
    SymbolNotFound(String),

    /// Declared plugin dependencies are not installed
    #[error("Missing dependency plugins: {}", .0.join(", "))]
    MissingDependencies(Vec<String>),

    /// Plugin lives outside the writable plugin directory
    #[error("Plugin is not removable: {0}")]
    NotRemovable(String),

    /// No writable plugin directory configured
    #[error("No plugin directory configured")]
    NoPluginDirectory,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Catch-all for plugin-provided failures
    #[error("{0}")]
    Other(String),
}

/// Result type for plugin host operations
pub type Result<T> = std::result::Result<T, HostError>;

/// Stable error codes surfaced on plugin records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PluginErrorCode {
    /// Malformed package metadata
    ManifestError,
    /// A declared injection has no provider
    MissingService,
    /// The plugin participates in a dependency cycle
    Cycle,
    /// Factory resolution or invocation failed
    LoadFailed,
}

impl std::fmt::Display for PluginErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PluginErrorCode::ManifestError => "manifest-error",
            PluginErrorCode::MissingService => "missing-service",
            PluginErrorCode::Cycle => "cycle",
            PluginErrorCode::LoadFailed => "load-failed",
        };
        f.write_str(s)
    }
}

/// Error details attached to a plugin record, surfaced through `list()`.
#[derive(Debug, Clone, Serialize)]
pub struct PluginErrorInfo {
    pub code: PluginErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl PluginErrorInfo {
    pub fn new(code: PluginErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}
