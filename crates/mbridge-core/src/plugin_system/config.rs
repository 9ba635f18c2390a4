use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde_json::{Map, Value, json};

use crate::plugin_system::error::PluginSystemError;
use crate::plugin_system::manifest::PluginManifest;
use crate::plugin_system::traits::PlatformType;
use crate::storage::config::{ConfigData, ConfigManager, ConfigScope};

/// Loads, seeds and validates per-plugin configuration documents
/// (`<home>/<name>.config.json`).
#[derive(Debug, Clone)]
pub struct PluginConfigLoader {
    config_manager: Arc<ConfigManager>,
    templates: HashMap<String, Value>,
}

impl PluginConfigLoader {
    pub fn new(config_manager: Arc<ConfigManager>) -> Self {
        Self {
            config_manager,
            templates: HashMap::new(),
        }
    }

    /// Built-in template used when a known plugin ships no default file
    pub fn with_template(mut self, plugin: &str, template: Value) -> Self {
        self.templates.insert(plugin.to_string(), template);
        self
    }

    pub fn add_template(&mut self, plugin: &str, template: Value) {
        self.templates.insert(plugin.to_string(), template);
    }

    pub fn exists(&self, plugin: &str) -> bool {
        self.config_manager.config_exists(plugin, ConfigScope::Plugin)
    }

    /// Read the plugin's configuration, creating it on first use from the
    /// plugin's default file, a built-in template or a bare scaffold.
    pub fn load_config(
        &self,
        manifest: &PluginManifest,
        dir: &Path,
        platform_type: PlatformType,
    ) -> Result<Value, PluginSystemError> {
        let name = manifest.name.as_str();
        if self.exists(name) {
            let data = self.config_manager.load_config(name, ConfigScope::Plugin)?;
            return Ok(data.to_value());
        }

        let seeded = match self.default_file(manifest, dir)? {
            Some(value) => {
                log::debug!("Seeding configuration of '{}' from its default file", name);
                value
            }
            None => match self.templates.get(name) {
                Some(template) => {
                    log::debug!("Seeding configuration of '{}' from built-in template", name);
                    template.clone()
                }
                None => Value::Object(Map::new()),
            },
        };
        let config = with_scaffold(seeded, name, platform_type);
        self.save_config(name, &config)?;
        log::info!("Created configuration file for plugin '{}'", name);
        Ok(config)
    }

    pub fn save_config(&self, plugin: &str, config: &Value) -> Result<(), PluginSystemError> {
        let data = ConfigData::from_value(config.clone()).ok_or_else(|| PluginSystemError::LoadFailed {
            plugin: plugin.to_string(),
            message: "configuration must be a JSON object".to_string(),
        })?;
        self.config_manager.save_config(plugin, &data, ConfigScope::Plugin)?;
        Ok(())
    }

    pub fn remove_config(&self, plugin: &str) -> Result<(), PluginSystemError> {
        self.config_manager.remove_config(plugin, ConfigScope::Plugin)?;
        Ok(())
    }

    /// Plugin schema file when present, otherwise a schema covering the scaffold keys
    pub fn load_schema(&self, manifest: &PluginManifest, dir: &Path) -> Result<Value, PluginSystemError> {
        let candidate = match manifest.schema.as_deref() {
            Some(relative) => dir.join(relative),
            None => dir.join(format!("{}.schema.json", manifest.name)),
        };
        if candidate.is_file() {
            return read_json(&candidate);
        }
        Ok(default_schema(&manifest.name))
    }

    /// Validation problems, one message per error. Never fails the load.
    pub fn validate(&self, plugin: &str, config: &Value, schema: &Value) -> Vec<String> {
        let validator = match jsonschema::validator_for(schema) {
            Ok(validator) => validator,
            Err(e) => {
                log::warn!("Schema of plugin '{}' is not usable: {}", plugin, e);
                return vec![format!("invalid schema: {}", e)];
            }
        };
        validator
            .iter_errors(config)
            .map(|error| {
                let location = error.instance_path.to_string();
                if location.is_empty() {
                    error.to_string()
                } else {
                    format!("{}: {}", location, error)
                }
            })
            .collect()
    }

    fn default_file(&self, manifest: &PluginManifest, dir: &Path) -> Result<Option<Value>, PluginSystemError> {
        let Some(relative) = manifest.default_config.as_deref() else {
            return Ok(None);
        };
        let path = dir.join(relative);
        if !path.is_file() {
            log::warn!(
                "Default configuration '{}' of plugin '{}' does not exist",
                path.display(),
                manifest.name
            );
            return Ok(None);
        }
        read_json(&path).map(Some)
    }
}

fn read_json(path: &Path) -> Result<Value, PluginSystemError> {
    let content = std::fs::read_to_string(path).map_err(|e| PluginSystemError::ManifestInvalid {
        path: path.to_path_buf(),
        message: "unreadable".to_string(),
        source: Some(Box::new(e)),
    })?;
    serde_json::from_str(&content).map_err(|e| PluginSystemError::ManifestInvalid {
        path: path.to_path_buf(),
        message: "not valid JSON".to_string(),
        source: Some(Box::new(e)),
    })
}

/// Fill the keys every plugin configuration carries, keeping existing values
pub fn with_scaffold(seed: Value, plugin: &str, platform_type: PlatformType) -> Value {
    let mut map = match seed {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    map.insert("name".to_string(), Value::String(plugin.to_string()));
    map.insert("type".to_string(), Value::String(platform_type.to_string()));
    map.entry("debug").or_insert(Value::Bool(false));
    map.entry("unregisterOnShutdown").or_insert(Value::Bool(false));
    Value::Object(map)
}

pub fn default_schema(plugin: &str) -> Value {
    json!({
        "title": plugin,
        "type": "object",
        "properties": {
            "name": { "type": "string" },
            "type": {
                "type": "string",
                "enum": ["AnyPlatform", "AccessoryPlatform", "DynamicPlatform"]
            },
            "debug": { "type": "boolean" },
            "unregisterOnShutdown": { "type": "boolean" }
        },
        "required": ["name", "type", "debug", "unregisterOnShutdown"]
    })
}
