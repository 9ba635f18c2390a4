use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::storage::error::{StorageResult, StorageSystemError};
use crate::storage::StorageProvider;

/// Supported configuration file formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    /// JSON format (.json)
    Json,
    /// YAML format (.yaml, .yml) - requires "yaml-config" feature
    #[cfg(feature = "yaml-config")]
    Yaml,
    /// TOML format (.toml) - requires "toml-config" feature
    #[cfg(feature = "toml-config")]
    Toml,
}

impl ConfigFormat {
    /// Get the file extension for this format
    pub fn extension(&self) -> &'static str {
        match self {
            ConfigFormat::Json => "json",
            #[cfg(feature = "yaml-config")]
            ConfigFormat::Yaml => "yaml",
            #[cfg(feature = "toml-config")]
            ConfigFormat::Toml => "toml",
        }
    }

    /// Determine format from file extension
    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|ext| ext.to_str())
            .and_then(|ext| match ext.to_lowercase().as_str() {
                "json" => Some(ConfigFormat::Json),
                #[cfg(feature = "yaml-config")]
                "yaml" | "yml" => Some(ConfigFormat::Yaml),
                #[cfg(feature = "toml-config")]
                "toml" => Some(ConfigFormat::Toml),
                _ => None,
            })
    }
}

/// In-memory representation of a configuration document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigData {
    #[serde(flatten)]
    values: Map<String, Value>,
}

impl ConfigData {
    pub fn new() -> Self {
        Self { values: Map::new() }
    }

    /// Build from a JSON value; non-object values yield `None`
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(values) => Some(Self { values }),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.values.clone())
    }

    /// Get a configuration value
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.values
            .get(key)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    /// Get a configuration value with default
    pub fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        self.get(key).unwrap_or(default)
    }

    /// Set a configuration value
    pub fn set<T: Serialize>(&mut self, key: &str, value: T) -> StorageResult<()> {
        let json_value = serde_json::to_value(value).map_err(|e| StorageSystemError::serialization("json", e))?;
        self.values.insert(key.to_string(), json_value);
        Ok(())
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.values.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        self.values.keys().cloned().collect()
    }

    /// Merge with another config, overriding existing values
    pub fn merge(&mut self, other: &ConfigData) {
        for (key, value) in &other.values {
            self.values.insert(key.clone(), value.clone());
        }
    }

    /// Serialize to string based on format
    pub fn serialize(&self, format: ConfigFormat) -> StorageResult<String> {
        match format {
            ConfigFormat::Json => {
                serde_json::to_string_pretty(&self).map_err(|e| StorageSystemError::serialization("json", e))
            }
            #[cfg(feature = "yaml-config")]
            ConfigFormat::Yaml => {
                serde_yaml::to_string(&self).map_err(|e| StorageSystemError::serialization("yaml", e))
            }
            #[cfg(feature = "toml-config")]
            ConfigFormat::Toml => {
                toml::to_string_pretty(&self).map_err(|e| StorageSystemError::serialization("toml", e))
            }
        }
    }

    /// Deserialize from string based on format
    pub fn deserialize(data: &str, format: ConfigFormat) -> StorageResult<Self> {
        match format {
            ConfigFormat::Json => {
                serde_json::from_str(data).map_err(|e| StorageSystemError::deserialization("json", e))
            }
            #[cfg(feature = "yaml-config")]
            ConfigFormat::Yaml => {
                serde_yaml::from_str(data).map_err(|e| StorageSystemError::deserialization("yaml", e))
            }
            #[cfg(feature = "toml-config")]
            ConfigFormat::Toml => {
                toml::from_str(data).map_err(|e| StorageSystemError::deserialization("toml", e))
            }
        }
    }
}

/// Where a configuration document lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigScope {
    /// `<home>/config/<name>.<ext>`
    Application,
    /// `<home>/<name>.config.<ext>`
    Plugin,
}

impl ConfigScope {
    fn cache_key(&self, name: &str) -> String {
        match self {
            ConfigScope::Application => format!("app:{}", name),
            ConfigScope::Plugin => format!("plugin:{}", name),
        }
    }
}

/// Loads, saves and caches configuration documents through a [`StorageProvider`]
#[derive(Debug)]
pub struct ConfigManager {
    provider: Arc<dyn StorageProvider>,
    app_config_path: PathBuf,
    plugin_config_path: PathBuf,
    default_format: ConfigFormat,
    cache: Mutex<HashMap<String, ConfigData>>,
}

impl ConfigManager {
    pub fn new(
        provider: Arc<dyn StorageProvider>,
        app_config_path: PathBuf,
        plugin_config_path: PathBuf,
        default_format: ConfigFormat,
    ) -> Self {
        Self {
            provider,
            app_config_path,
            plugin_config_path,
            default_format,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn app_config_path(&self) -> &Path {
        &self.app_config_path
    }

    pub fn plugin_config_path(&self) -> &Path {
        &self.plugin_config_path
    }

    pub fn default_format(&self) -> ConfigFormat {
        self.default_format
    }

    pub fn provider(&self) -> &Arc<dyn StorageProvider> {
        &self.provider
    }

    /// Resolve the provider-relative path for a configuration file
    pub fn resolve_config_path(&self, name: &str, scope: ConfigScope) -> PathBuf {
        match scope {
            ConfigScope::Application => {
                let file_name = if Path::new(name).extension().is_some() {
                    name.to_string()
                } else {
                    format!("{}.{}", name, self.default_format.extension())
                };
                self.app_config_path.join(file_name)
            }
            ConfigScope::Plugin => self
                .plugin_config_path
                .join(format!("{}.config.{}", name, self.default_format.extension())),
        }
    }

    pub fn config_exists(&self, name: &str, scope: ConfigScope) -> bool {
        self.provider.is_file(&self.resolve_config_path(name, scope))
    }

    /// Load configuration from disk. A missing file yields an empty document.
    pub fn load_config(&self, name: &str, scope: ConfigScope) -> StorageResult<ConfigData> {
        let cache_key = scope.cache_key(name);
        if let Some(config) = self.cache_lock().get(&cache_key) {
            return Ok(config.clone());
        }

        let path = self.resolve_config_path(name, scope);
        if !self.provider.exists(&path) {
            return Ok(ConfigData::new());
        }

        let format = ConfigFormat::from_path(&path)
            .ok_or_else(|| StorageSystemError::UnsupportedConfigFormat(path.display().to_string()))?;
        let content = self.provider.read_to_string(&path)?;
        let config = ConfigData::deserialize(&content, format)?;

        self.cache_lock().insert(cache_key, config.clone());
        Ok(config)
    }

    /// Save configuration to disk
    pub fn save_config(&self, name: &str, config: &ConfigData, scope: ConfigScope) -> StorageResult<()> {
        let path = self.resolve_config_path(name, scope);
        if let Some(parent) = path.parent() {
            self.provider.create_dir_all(parent)?;
        }
        let format = ConfigFormat::from_path(&path).unwrap_or(self.default_format);
        let content = config.serialize(format)?;
        self.provider.write_string(&path, &content)?;

        self.cache_lock().insert(scope.cache_key(name), config.clone());
        Ok(())
    }

    /// Delete a configuration file if present
    pub fn remove_config(&self, name: &str, scope: ConfigScope) -> StorageResult<()> {
        let path = self.resolve_config_path(name, scope);
        self.cache_lock().remove(&scope.cache_key(name));
        if self.provider.is_file(&path) {
            self.provider.remove_file(&path)?;
        }
        Ok(())
    }

    pub fn clear_cache(&self) {
        self.cache_lock().clear();
    }

    /// List configuration names present on disk for a scope
    pub fn list_configs(&self, scope: ConfigScope) -> StorageResult<Vec<String>> {
        let dir_path = match scope {
            ConfigScope::Application => self.app_config_path.clone(),
            ConfigScope::Plugin => self.plugin_config_path.clone(),
        };
        if !self.provider.is_dir(&dir_path) {
            return Ok(vec![]);
        }

        let suffix = format!(".config.{}", self.default_format.extension());
        let names = self
            .provider
            .read_dir(&dir_path)?
            .into_iter()
            .filter(|path| self.provider.is_file(path))
            .filter_map(|path| {
                let file_name = path.file_name()?.to_str()?.to_string();
                match scope {
                    ConfigScope::Plugin => file_name.strip_suffix(&suffix).map(str::to_string),
                    ConfigScope::Application => {
                        ConfigFormat::from_path(&path)?;
                        path.file_stem()?.to_str().map(str::to_string)
                    }
                }
            })
            .collect();
        Ok(names)
    }

    fn cache_lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, ConfigData>> {
        // A poisoned cache only holds clones of on-disk data
        self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
