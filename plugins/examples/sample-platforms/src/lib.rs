//! Sample platforms shipped with mbridge.
//!
//! [`register`] adds both entry points to a [`StaticPlatformLoader`]; the
//! matching `plugin.json` manifests live under [`manifests_dir`].
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use mbridge_core::plugin_system::StaticPlatformLoader;
use mbridge_core::plugin_system::traits::{
    BridgeHandle, BridgedDevice, LifecycleReason, Platform, PlatformContext, PlatformError, PlatformType,
};
use mbridge_core::storage::context::StorageContext;

pub const ACCESSORY_ENTRY: &str = "sample-accessory";
pub const DYNAMIC_ENTRY: &str = "sample-dynamic";

/// Storage key under which the dynamic sample remembers its devices
const KNOWN_DEVICES_KEY: &str = "devices";

/// Directory holding one manifest directory per sample
pub fn manifests_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("manifests")
}

pub fn register(loader: &mut StaticPlatformLoader) {
    loader.register(ACCESSORY_ENTRY, |context: PlatformContext| {
        Ok(Arc::new(SampleAccessory::new(context)) as Arc<dyn Platform>)
    });
    loader.register(DYNAMIC_ENTRY, |context: PlatformContext| {
        Ok(Arc::new(SampleDynamic::new(context)?) as Arc<dyn Platform>)
    });
}

/// One contact sensor. The device name comes from the `deviceName` config key.
pub struct SampleAccessory {
    bridge: BridgeHandle,
    device: BridgedDevice,
    debug: bool,
}

impl SampleAccessory {
    pub fn new(context: PlatformContext) -> Self {
        let label = context
            .config
            .get("deviceName")
            .and_then(Value::as_str)
            .unwrap_or("Front Door");
        Self {
            device: BridgedDevice::new("contact", label, "contact-sensor"),
            debug: context.debug(),
            bridge: context.bridge,
        }
    }
}

#[async_trait]
impl Platform for SampleAccessory {
    fn platform_type(&self) -> PlatformType {
        PlatformType::AccessoryPlatform
    }

    async fn on_start(&self, reason: LifecycleReason) -> Result<(), PlatformError> {
        if self.debug {
            log::debug!("[{}] starting ({})", self.bridge.plugin(), reason);
        }
        self.bridge.register_device(self.device.clone()).await?;
        Ok(())
    }

    async fn on_shutdown(&self, reason: LifecycleReason) -> Result<(), PlatformError> {
        log::info!("[{}] shutting down ({})", self.bridge.plugin(), reason);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct LightConfig {
    id: String,
    name: String,
}

/// Lights listed under the `lights` config key, two defaults otherwise.
///
/// Lights seen on an earlier run but no longer configured are dropped
/// from the device set when the platform is configured.
pub struct SampleDynamic {
    bridge: BridgeHandle,
    storage: StorageContext,
    lights: Vec<LightConfig>,
}

impl SampleDynamic {
    pub fn new(context: PlatformContext) -> Result<Self, PlatformError> {
        let lights = match context.config.get("lights") {
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|e| PlatformError(format!("invalid 'lights' configuration: {}", e)))?,
            None => vec![
                LightConfig {
                    id: "kitchen".to_string(),
                    name: "Kitchen".to_string(),
                },
                LightConfig {
                    id: "hallway".to_string(),
                    name: "Hallway".to_string(),
                },
            ],
        };
        Ok(Self {
            bridge: context.bridge,
            storage: context.storage,
            lights,
        })
    }

    fn storage_error(e: impl std::fmt::Display) -> PlatformError {
        PlatformError(format!("storage: {}", e))
    }
}

#[async_trait]
impl Platform for SampleDynamic {
    fn platform_type(&self) -> PlatformType {
        PlatformType::DynamicPlatform
    }

    async fn on_start(&self, _reason: LifecycleReason) -> Result<(), PlatformError> {
        for light in &self.lights {
            self.bridge
                .register_device(BridgedDevice::new(light.id.clone(), light.name.clone(), "light"))
                .await?;
        }
        Ok(())
    }

    async fn on_configure(&self) -> Result<(), PlatformError> {
        let known: Vec<String> = self
            .storage
            .get(KNOWN_DEVICES_KEY, Vec::new())
            .await
            .map_err(Self::storage_error)?;
        for stale in known.iter().filter(|id| !self.lights.iter().any(|l| &l.id == *id)) {
            log::info!("[{}] dropping stale light '{}'", self.bridge.plugin(), stale);
            if let Err(e) = self.bridge.unregister_device(stale).await {
                log::debug!("[{}] '{}' was not registered: {}", self.bridge.plugin(), stale, e);
            }
        }
        let current: Vec<&str> = self.lights.iter().map(|l| l.id.as_str()).collect();
        self.storage
            .set(KNOWN_DEVICES_KEY, &current)
            .await
            .map_err(Self::storage_error)?;
        Ok(())
    }

    async fn on_shutdown(&self, reason: LifecycleReason) -> Result<(), PlatformError> {
        log::info!("[{}] shutting down ({})", self.bridge.plugin(), reason);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use mbridge_core::plugin_system::PlatformLoader;
    use mbridge_core::plugin_system::manifest::PluginManifest;

    #[test]
    fn test_manifests_point_at_registered_entries() {
        let mut loader = StaticPlatformLoader::new();
        register(&mut loader);
        assert_eq!(loader.entries(), vec![ACCESSORY_ENTRY.to_string(), DYNAMIC_ENTRY.to_string()]);

        for sample in [ACCESSORY_ENTRY, DYNAMIC_ENTRY] {
            let path = manifests_dir().join(sample).join("plugin.json");
            let manifest = PluginManifest::from_file(&path).unwrap();
            assert_eq!(manifest.name, sample);
            assert!(loader.has_entry_point(&manifest));
        }
    }

    #[test]
    fn test_lights_config_must_be_a_list() {
        let bad: Result<Vec<LightConfig>, _> = serde_json::from_value(serde_json::json!({ "id": "x" }));
        assert!(bad.is_err());
    }
}
