//! # mbridge Plugin System Errors
//!
//! [`PluginSystemError`] covers the three failure families of the plugin
//! manager: resolution (the manifest cannot be found or is not acceptable),
//! lifecycle preconditions (the operation does not apply to the plugin's
//! current state) and hook failures (the plugin's own code failed).
//!
//! `NotFound` and `Precondition` are distinct so callers can tell "no such
//! plugin" from "plugin exists but is not loaded".
use std::path::PathBuf;

use crate::storage::error::StorageSystemError;

#[derive(Debug, thiserror::Error)]
pub enum PluginSystemError {
    #[error("Plugin '{name}' is not registered")]
    NotFound { name: String },

    #[error("Plugin '{name}' is already registered")]
    AlreadyRegistered { name: String },

    #[error("Cannot {operation} plugin '{plugin}': {message}")]
    Precondition {
        plugin: String,
        operation: String,
        message: String,
    },

    #[error("No plugin manifest found for '{target}'")]
    ManifestNotFound { target: String, path: Option<PathBuf> },

    #[error("Plugin manifest error for '{path}': {message}")]
    ManifestInvalid {
        path: PathBuf,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Plugin '{plugin}' depends on core-internal package '{dependency}'")]
    ForbiddenDependency { plugin: String, dependency: String },

    #[error("Plugin '{plugin}' is not a loadable platform module")]
    NotAModule { plugin: String },

    #[error("Plugin '{plugin}' does not declare an entry point")]
    MissingEntryPoint { plugin: String },

    #[error("Plugin '{plugin}' requires core API '{required}', this core provides {api_version}")]
    Incompatible {
        plugin: String,
        required: String,
        api_version: String,
    },

    #[error("Plugin loading failed for '{plugin}': {message}")]
    LoadFailed { plugin: String, message: String },

    #[error("Plugin '{plugin}' failed in {hook}: {message}")]
    HookFailed {
        plugin: String,
        hook: String,
        message: String,
    },

    #[error("Plugin '{plugin}' was shut down while {operation} was in progress")]
    Stale { plugin: String, operation: String },

    #[error("No device host is attached for plugin '{plugin}'")]
    HostUnavailable { plugin: String },

    #[error("Package {operation} failed for '{package}': {message}")]
    PackageFailed {
        package: String,
        operation: String,
        message: String,
    },

    #[error("Plugin storage error: {0}")]
    Storage(#[from] StorageSystemError),
}

impl PluginSystemError {
    pub fn precondition(plugin: &str, operation: &str, message: impl Into<String>) -> Self {
        PluginSystemError::Precondition {
            plugin: plugin.to_string(),
            operation: operation.to_string(),
            message: message.into(),
        }
    }

    pub fn not_found(name: &str) -> Self {
        PluginSystemError::NotFound { name: name.to_string() }
    }

    /// Whether the failure came from resolving or validating a manifest
    pub fn is_resolution(&self) -> bool {
        matches!(
            self,
            PluginSystemError::ManifestNotFound { .. }
                | PluginSystemError::ManifestInvalid { .. }
                | PluginSystemError::ForbiddenDependency { .. }
                | PluginSystemError::NotAModule { .. }
                | PluginSystemError::MissingEntryPoint { .. }
                | PluginSystemError::Incompatible { .. }
        )
    }
}
