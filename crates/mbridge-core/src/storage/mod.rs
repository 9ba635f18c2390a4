//! # mbridge Storage
//!
//! Filesystem access, configuration documents and the namespaced
//! persistence store that keeps plugin registrations and endpoint
//! identities durable across restarts.
//!
//! - [`provider`]: the [`StorageProvider`] abstraction over file access.
//! - [`local`]: [`LocalStorageProvider`], atomic writes via temp file + rename.
//! - [`config`]: [`ConfigManager`] and [`ConfigData`] for application and plugin configuration.
//! - [`context`]: [`PersistenceStore`] and [`StorageContext`], one JSON document per namespace.
//! - [`manager`]: [`DefaultStorageManager`], the home directory owner.
pub mod config;
pub mod context;
pub mod error;
pub mod local;
pub mod manager;
pub mod provider;

pub use config::{ConfigData, ConfigFormat, ConfigManager, ConfigScope};
pub use context::{JsonContextStore, PersistenceStore, StorageContext};
pub use error::{StorageResult, StorageSystemError};
pub use local::LocalStorageProvider;
pub use manager::DefaultStorageManager;
pub use provider::StorageProvider;

#[cfg(test)]
mod tests;
