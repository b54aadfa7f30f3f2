//! Host configuration.

use std::path::PathBuf;

/// Configuration for a [`PluginHost`](crate::host::PluginHost).
#[derive(Debug, Clone)]
pub struct PluginHostOptions {
    /// Directories scanned for plugin packages, in precedence order. The
    /// first directory is also the install target.
    pub plugin_directories: Vec<PathBuf>,
    /// Environment name handed to every plugin's host builder.
    pub environment: String,
}

impl PluginHostOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the search directories.
    pub fn plugin_directories(mut self, dirs: impl IntoIterator<Item = PathBuf>) -> Self {
        self.plugin_directories = dirs.into_iter().collect();
        self
    }

    /// Append one search directory.
    pub fn add_plugin_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.plugin_directories.push(dir.into());
        self
    }

    pub fn environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = environment.into();
        self
    }

    /// The writable directory used for installs and uninstalls.
    pub fn install_directory(&self) -> Option<&PathBuf> {
        self.plugin_directories.first()
    }
}

impl Default for PluginHostOptions {
    fn default() -> Self {
        let mut plugin_directories = Vec::new();
        if let Some(data) = dirs::data_dir() {
            plugin_directories.push(data.join("plugin-host").join("plugins"));
        }
        if let Ok(cwd) = std::env::current_dir() {
            plugin_directories.push(cwd.join("plugins"));
        }
        Self {
            plugin_directories,
            environment: "production".to_string(),
        }
    }
}
