use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use crate::kernel::component::KernelComponent;
use crate::kernel::constants;
use crate::kernel::error::Result;
use crate::storage::config::{ConfigFormat, ConfigManager, ConfigScope};
use crate::storage::context::{JsonContextStore, PersistenceStore};
use crate::storage::error::{StorageResult, StorageSystemError};
use crate::storage::local::LocalStorageProvider;
use crate::storage::provider::StorageProvider;

/// Owns the home directory layout, the configuration manager and the
/// persistence store.
///
/// Layout under `<home>`:
/// - `config/mbridge.json` application configuration
/// - `<plugin>.config.json` per-plugin configuration
/// - `storage/<namespace>.json` persistence contexts
/// - `plugins/` installed plugin packages
pub struct DefaultStorageManager {
    name: &'static str,
    home: PathBuf,
    provider: Arc<LocalStorageProvider>,
    config_manager: Arc<ConfigManager>,
    store: Arc<JsonContextStore>,
}

impl DefaultStorageManager {
    pub fn new(home: PathBuf) -> Self {
        let provider = Arc::new(LocalStorageProvider::new(home.clone()));
        let shared: Arc<dyn StorageProvider> = provider.clone();

        let config_manager = ConfigManager::new(
            shared.clone(),
            PathBuf::from(constants::APP_CONFIG_DIR),
            PathBuf::new(),
            ConfigFormat::Json,
        );
        let store = JsonContextStore::new(shared, PathBuf::from(constants::STORAGE_DIR));

        Self {
            name: "DefaultStorageManager",
            home,
            provider,
            config_manager: Arc::new(config_manager),
            store: Arc::new(store),
        }
    }

    /// Pick the home directory: explicit override, then `MBRIDGE_HOME`, then `~/.mbridge`
    pub fn resolve_home(override_path: Option<PathBuf>) -> StorageResult<PathBuf> {
        if let Some(path) = override_path {
            return Ok(path);
        }
        if let Some(path) = std::env::var_os(constants::HOME_ENV_VAR).filter(|v| !v.is_empty()) {
            return Ok(PathBuf::from(path));
        }
        dirs::home_dir()
            .map(|home| home.join(constants::DEFAULT_HOME_DIR_NAME))
            .ok_or(StorageSystemError::HomeUnavailable)
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn provider(&self) -> &Arc<LocalStorageProvider> {
        &self.provider
    }

    pub fn config_manager(&self) -> &Arc<ConfigManager> {
        &self.config_manager
    }

    pub fn store(&self) -> Arc<dyn PersistenceStore> {
        self.store.clone()
    }

    /// Directory packages are installed into
    pub fn plugins_dir(&self) -> PathBuf {
        self.home.join(constants::PLUGINS_DIR)
    }

    pub fn ensure_directories(&self) -> StorageResult<()> {
        self.provider.create_dir_all(Path::new(constants::APP_CONFIG_DIR))?;
        self.provider.create_dir_all(Path::new(constants::STORAGE_DIR))?;
        self.provider.create_dir_all(Path::new(constants::PLUGINS_DIR))?;
        Ok(())
    }

    /// Remove every persistence context and configuration file.
    /// Installed plugin packages are kept.
    pub async fn factory_reset(&self) -> StorageResult<()> {
        self.store.close_all().await?;
        for namespace in self.store.namespaces().await? {
            self.store.remove_context(&namespace).await?;
        }
        for plugin in self.config_manager.list_configs(ConfigScope::Plugin)? {
            self.config_manager.remove_config(&plugin, ConfigScope::Plugin)?;
        }
        for name in self.config_manager.list_configs(ConfigScope::Application)? {
            self.config_manager.remove_config(&name, ConfigScope::Application)?;
        }
        self.config_manager.clear_cache();
        log::info!("Factory reset completed for {}", self.home.display());
        Ok(())
    }
}

impl Debug for DefaultStorageManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DefaultStorageManager")
            .field("name", &self.name)
            .field("home", &self.home)
            .field("provider", &self.provider.name())
            .finish()
    }
}

#[async_trait]
impl KernelComponent for DefaultStorageManager {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn initialize(&self) -> Result<()> {
        self.ensure_directories()?;
        log::info!("Using home directory: {}", self.home.display());
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.store.close_all().await?;
        Ok(())
    }
}
