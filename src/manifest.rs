//! Manifest resolution and plugin package discovery.
//!
//! An installable package is a directory with a `package.json` carrying a
//! `plugin` section. Directories without that section are simply not
//! plugins; directories with a malformed section fail resolution.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{HostError, Result};

/// Metadata file read from each package directory.
pub const METADATA_FILE: &str = "package.json";

/// How a resolved entry point is loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleFormat {
    /// Native dynamic library (`.so` / `.dylib` / `.dll`).
    Native,
    /// In-process module registered with the host (`.plugin` marker files).
    Registered,
}

/// A resolved plugin entry point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntryPoint {
    /// Absolute path to the entry file.
    pub file: PathBuf,
    pub format: ModuleFormat,
}

/// Entry points per execution context.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PluginTargets {
    pub main: Option<EntryPoint>,
    pub renderer: Option<EntryPoint>,
}

/// Services a plugin exposes to and requires from the shared registry.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ServiceDeclarations {
    pub provide: Vec<String>,
    pub inject: Vec<String>,
}

/// Settings namespace configuration.
#[derive(Debug, Clone, Serialize)]
pub struct SettingsSection {
    pub namespace: String,
    pub schema: Option<PathBuf>,
}

/// Immutable description of one installable plugin.
///
/// Created by [`resolve_manifest`]; superseded, never mutated, on re-scan.
#[derive(Debug, Clone, Serialize)]
pub struct PluginManifest {
    pub name: String,
    pub version: String,
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub targets: PluginTargets,
    /// Deduplicated package-name dependencies.
    pub dependencies: Vec<String>,
    pub services: ServiceDeclarations,
    pub settings: SettingsSection,
    pub root_dir: PathBuf,
    pub metadata_path: PathBuf,
    /// Default enabled state declared by the package.
    pub enabled: bool,
    /// Stable content hash used for change detection across scans.
    pub hash: String,
    pub mtime: Option<SystemTime>,
}

#[derive(Debug, Default, Deserialize)]
struct PackageMetadata {
    name: Option<String>,
    version: Option<String>,
    #[serde(rename = "displayName")]
    display_name: Option<String>,
    description: Option<String>,
    plugin: Option<PluginSection>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct PluginSection {
    display_name: Option<String>,
    description: Option<String>,
    targets: TargetsSection,
    dependencies: Vec<String>,
    services: ServicesSection,
    settings: RawSettingsSection,
    enabled: Option<bool>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
struct TargetsSection {
    main: Option<String>,
    renderer: Option<String>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
struct ServicesSection {
    provide: Vec<String>,
    inject: Vec<String>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
struct RawSettingsSection {
    namespace: Option<String>,
    schema: Option<String>,
}

fn detect_format(file: &Path) -> Option<ModuleFormat> {
    match file.extension().and_then(|e| e.to_str()) {
        Some("so") | Some("dylib") | Some("dll") => Some(ModuleFormat::Native),
        Some("plugin") => Some(ModuleFormat::Registered),
        _ => None,
    }
}

fn to_entry(root: &Path, rel: Option<&str>) -> Result<Option<EntryPoint>> {
    let Some(rel) = rel else {
        return Ok(None);
    };
    let file = if Path::new(rel).is_absolute() {
        PathBuf::from(rel)
    } else {
        root.join(rel)
    };
    let Some(format) = detect_format(&file) else {
        return Err(HostError::UnsupportedEntry(rel.to_string()));
    };
    Ok(Some(EntryPoint { file, format }))
}

fn dedupe(values: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    values.into_iter().filter(|v| seen.insert(v.clone())).collect()
}

/// Resolve a plugin manifest from a package directory.
///
/// Returns `Ok(None)` when the directory is not a plugin (no metadata file
/// or no plugin section). Malformed metadata and missing identity fields
/// fail with [`HostError::Manifest`].
pub fn resolve_manifest(package_dir: &Path) -> Result<Option<PluginManifest>> {
    let metadata_path = package_dir.join(METADATA_FILE);
    let Ok(raw) = std::fs::read(&metadata_path) else {
        return Ok(None);
    };

    let pkg: PackageMetadata =
        serde_json::from_slice(&raw).map_err(|e| HostError::Manifest {
            dir: package_dir.to_path_buf(),
            message: format!("failed to parse {METADATA_FILE}: {e}"),
        })?;

    let Some(section) = pkg.plugin else {
        return Ok(None);
    };

    let (Some(name), Some(version)) = (pkg.name, pkg.version) else {
        return Err(HostError::Manifest {
            dir: package_dir.to_path_buf(),
            message: format!("{METADATA_FILE} must provide name and version"),
        });
    };

    let targets = PluginTargets {
        main: to_entry(package_dir, section.targets.main.as_deref())?,
        renderer: to_entry(package_dir, section.targets.renderer.as_deref())?,
    };

    let mut hasher = Sha256::new();
    hasher.update(&raw);
    hasher.update(serde_json::to_vec(&section)?);
    let hash = hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<String>();

    let mtime = std::fs::metadata(&metadata_path)
        .and_then(|m| m.modified())
        .ok();

    Ok(Some(PluginManifest {
        display_name: section.display_name.or(pkg.display_name),
        description: section.description.or(pkg.description),
        targets,
        dependencies: dedupe(section.dependencies),
        services: ServiceDeclarations {
            provide: dedupe(section.services.provide),
            inject: dedupe(section.services.inject),
        },
        settings: SettingsSection {
            namespace: section.settings.namespace.unwrap_or_else(|| name.clone()),
            schema: section.settings.schema.map(|s| package_dir.join(s)),
        },
        root_dir: package_dir.to_path_buf(),
        metadata_path,
        enabled: section.enabled.unwrap_or(true),
        hash,
        mtime,
        name,
        version,
    }))
}

/// Discover plugin packages under the given search roots.
///
/// Lists immediate subdirectories of each root and attempts resolution on
/// each. Per-directory failures are logged and skipped so one broken
/// package cannot block discovery of the rest.
pub fn discover_plugins(roots: &[PathBuf]) -> Vec<PluginManifest> {
    let mut results = Vec::new();
    for root in roots {
        let Ok(entries) = std::fs::read_dir(root) else {
            continue;
        };
        let mut dirs: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect();
        dirs.sort();

        for dir in dirs {
            match resolve_manifest(&dir) {
                Ok(Some(manifest)) => results.push(manifest),
                Ok(None) => {}
                Err(error) => {
                    tracing::warn!(dir = %dir.display(), %error, "skipping plugin with invalid manifest");
                }
            }
        }
    }
    results
}
