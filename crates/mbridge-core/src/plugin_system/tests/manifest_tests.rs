use std::path::Path;

use tempfile::tempdir;

use crate::plugin_system::error::PluginSystemError;
use crate::plugin_system::manifest::PluginManifest;
use crate::tests::fixtures::{TEST_ENTRY, write_plugin};

#[test]
fn test_minimal_manifest_is_valid() {
    let manifest = PluginManifest::new("sample", "1.2.3", "sample-entry");
    assert!(manifest.validate(Path::new("plugin.json")).is_ok());
    assert_eq!(manifest.entry_point().unwrap(), "sample-entry");
}

#[test]
fn test_from_file_reads_written_manifest() {
    let temp_dir = tempdir().expect("Failed to create temp directory");
    let dir = write_plugin(temp_dir.path(), "reader", Some(TEST_ENTRY));

    let manifest = PluginManifest::from_file(&dir.join("plugin.json")).unwrap();
    assert_eq!(manifest.name, "reader");
    assert_eq!(manifest.version, "1.0.0");
    assert_eq!(manifest.kind.as_deref(), Some("platform"));
    assert_eq!(manifest.entry.as_deref(), Some(TEST_ENTRY));
}

#[test]
fn test_missing_file_is_manifest_not_found() {
    let temp_dir = tempdir().expect("Failed to create temp directory");
    let result = PluginManifest::from_file(&temp_dir.path().join("plugin.json"));
    assert!(matches!(result, Err(PluginSystemError::ManifestNotFound { .. })));
}

#[test]
fn test_malformed_json_is_manifest_invalid() {
    let temp_dir = tempdir().expect("Failed to create temp directory");
    let path = temp_dir.path().join("plugin.json");
    std::fs::write(&path, "{ not json").unwrap();

    let err = PluginManifest::from_file(&path).unwrap_err();
    assert!(matches!(err, PluginSystemError::ManifestInvalid { .. }));
    assert!(err.is_resolution());
}

#[test]
fn test_non_semver_version_is_rejected() {
    let manifest = PluginManifest::new("sample", "one", "entry");
    assert!(matches!(
        manifest.validate(Path::new("plugin.json")),
        Err(PluginSystemError::ManifestInvalid { .. })
    ));
}

#[test]
fn test_forbidden_dependency_is_rejected() {
    let mut manifest = PluginManifest::new("sample", "1.0.0", "entry");
    manifest.dependencies.insert("mbridge".to_string(), "^1".to_string());

    match manifest.validate(Path::new("plugin.json")) {
        Err(PluginSystemError::ForbiddenDependency { plugin, dependency }) => {
            assert_eq!(plugin, "sample");
            assert_eq!(dependency, "mbridge");
        }
        other => panic!("expected ForbiddenDependency, got {:?}", other),
    }
}

#[test]
fn test_non_platform_kind_is_not_a_module() {
    let mut manifest = PluginManifest::new("sample", "1.0.0", "entry");
    manifest.kind = Some("library".to_string());
    assert!(matches!(
        manifest.validate(Path::new("plugin.json")),
        Err(PluginSystemError::NotAModule { .. })
    ));
}

#[test]
fn test_blank_entry_point_is_missing() {
    let mut manifest = PluginManifest::new("sample", "1.0.0", "entry");
    manifest.entry = Some("   ".to_string());
    assert!(matches!(manifest.entry_point(), Err(PluginSystemError::MissingEntryPoint { .. })));

    manifest.entry = None;
    assert!(matches!(
        manifest.validate(Path::new("plugin.json")),
        Err(PluginSystemError::MissingEntryPoint { .. })
    ));
}

#[test]
fn test_compatibility_range_is_checked_against_api_version() {
    let mut manifest = PluginManifest::new("sample", "1.0.0", "entry");
    assert!(manifest.check_compatibility("1.0.0").is_ok());

    manifest.compatibility = Some(">=1.0.0, <2.0.0".to_string());
    assert!(manifest.check_compatibility("1.4.2").is_ok());
    assert!(matches!(
        manifest.check_compatibility("2.0.0"),
        Err(PluginSystemError::Incompatible { .. })
    ));

    manifest.compatibility = Some("not a range".to_string());
    assert!(manifest.check_compatibility("1.0.0").is_err());
}
