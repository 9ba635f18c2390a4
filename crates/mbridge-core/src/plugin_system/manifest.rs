use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};

use crate::kernel::constants;
use crate::plugin_system::error::PluginSystemError;

/// Contents of a plugin's `plugin.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginManifest {
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub homepage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub help: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changelog: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub funding: Option<String>,
    /// Must be `platform` for the plugin to be loadable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Name the loader resolves to a platform factory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry: Option<String>,
    /// Range of core API versions the plugin accepts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compatibility: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dependencies: BTreeMap<String, String>,
    /// Default configuration file, relative to the plugin directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_config: Option<String>,
    /// Configuration schema file, relative to the plugin directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
}

impl PluginManifest {
    /// Minimal loadable manifest
    pub fn new(name: &str, version: &str, entry: &str) -> Self {
        Self {
            name: name.to_string(),
            version: version.to_string(),
            description: None,
            author: None,
            homepage: None,
            help: None,
            changelog: None,
            funding: None,
            kind: Some(constants::PLATFORM_MODULE_KIND.to_string()),
            entry: Some(entry.to_string()),
            compatibility: None,
            dependencies: BTreeMap::new(),
            default_config: None,
            schema: None,
        }
    }

    /// Parse a manifest file without validating it
    pub fn from_file(path: &Path) -> Result<Self, PluginSystemError> {
        if !path.is_file() {
            return Err(PluginSystemError::ManifestNotFound {
                target: path.display().to_string(),
                path: Some(path.to_path_buf()),
            });
        }
        let content = std::fs::read_to_string(path).map_err(|e| PluginSystemError::ManifestInvalid {
            path: path.to_path_buf(),
            message: "unreadable".to_string(),
            source: Some(Box::new(e)),
        })?;
        serde_json::from_str(&content).map_err(|e| PluginSystemError::ManifestInvalid {
            path: path.to_path_buf(),
            message: "not a valid plugin manifest".to_string(),
            source: Some(Box::new(e)),
        })
    }

    /// Check everything required before a plugin may be registered or loaded
    pub fn validate(&self, path: &Path) -> Result<(), PluginSystemError> {
        if self.name.trim().is_empty() {
            return Err(PluginSystemError::ManifestInvalid {
                path: path.to_path_buf(),
                message: "name is empty".to_string(),
                source: None,
            });
        }
        Version::parse(&self.version).map_err(|e| PluginSystemError::ManifestInvalid {
            path: path.to_path_buf(),
            message: format!("version '{}' is not semver", self.version),
            source: Some(Box::new(e)),
        })?;

        if let Some(dependency) = self
            .dependencies
            .keys()
            .find(|dep| constants::FORBIDDEN_DEPENDENCIES.contains(&dep.as_str()))
        {
            return Err(PluginSystemError::ForbiddenDependency {
                plugin: self.name.clone(),
                dependency: dependency.clone(),
            });
        }

        if self.kind.as_deref() != Some(constants::PLATFORM_MODULE_KIND) {
            return Err(PluginSystemError::NotAModule { plugin: self.name.clone() });
        }
        self.entry_point()?;
        self.check_compatibility(constants::API_VERSION)
    }

    pub fn entry_point(&self) -> Result<&str, PluginSystemError> {
        match self.entry.as_deref().map(str::trim) {
            Some(entry) if !entry.is_empty() => Ok(entry),
            _ => Err(PluginSystemError::MissingEntryPoint { plugin: self.name.clone() }),
        }
    }

    /// A manifest without a range accepts every core version
    pub fn check_compatibility(&self, api_version: &str) -> Result<(), PluginSystemError> {
        let Some(range) = self.compatibility.as_deref() else {
            return Ok(());
        };
        let incompatible = || PluginSystemError::Incompatible {
            plugin: self.name.clone(),
            required: range.to_string(),
            api_version: api_version.to_string(),
        };
        let requirement = VersionReq::parse(range).map_err(|_| incompatible())?;
        let version = Version::parse(api_version).map_err(|_| incompatible())?;
        if requirement.matches(&version) {
            Ok(())
        } else {
            Err(incompatible())
        }
    }
}

/// A manifest together with the directory it was found in
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedPlugin {
    pub manifest: PluginManifest,
    pub dir: PathBuf,
}

impl ResolvedPlugin {
    pub fn manifest_path(&self) -> PathBuf {
        self.dir.join(constants::PLUGIN_MANIFEST_FILE)
    }
}
