use std::path::PathBuf;

use tempfile::tempdir;

use crate::kernel::component::KernelComponent;
use crate::storage::config::{ConfigData, ConfigScope};
use crate::storage::manager::DefaultStorageManager;

#[test]
fn test_resolve_home_prefers_override() {
    let home = DefaultStorageManager::resolve_home(Some(PathBuf::from("/tmp/custom-home"))).expect("home");
    assert_eq!(home, PathBuf::from("/tmp/custom-home"));
}

#[tokio::test]
async fn test_initialize_creates_layout() {
    let temp_dir = tempdir().expect("Failed to create temp directory");
    let manager = DefaultStorageManager::new(temp_dir.path().to_path_buf());

    manager.initialize().await.expect("initialize");

    assert!(temp_dir.path().join("config").is_dir());
    assert!(temp_dir.path().join("storage").is_dir());
    assert!(temp_dir.path().join("plugins").is_dir());
    assert_eq!(manager.plugins_dir(), temp_dir.path().join("plugins"));
}

#[tokio::test]
async fn test_factory_reset_clears_contexts_and_configs_but_keeps_packages() {
    let temp_dir = tempdir().expect("Failed to create temp directory");
    let manager = DefaultStorageManager::new(temp_dir.path().to_path_buf());
    manager.initialize().await.expect("initialize");

    let store = manager.store();
    store.context("mbridge").await.expect("context").set("plugins", &Vec::<String>::new()).await.expect("set");
    let mut config = ConfigData::new();
    config.set("name", "sample").expect("set");
    manager.config_manager().save_config("sample", &config, ConfigScope::Plugin).expect("save");
    std::fs::create_dir_all(temp_dir.path().join("plugins/sample")).expect("package dir");

    manager.factory_reset().await.expect("factory reset");

    assert!(store.namespaces().await.expect("namespaces").is_empty());
    assert!(!temp_dir.path().join("sample.config.json").exists());
    assert!(temp_dir.path().join("plugins/sample").is_dir());
}
