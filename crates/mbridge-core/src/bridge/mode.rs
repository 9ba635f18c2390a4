use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::endpoint::record::EndpointDefaults;
use crate::kernel::constants;
use crate::storage::config::ConfigData;
use crate::storage::context::StorageContext;
use crate::storage::error::StorageResult;

/// How plugins are mapped onto server endpoints
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BridgeMode {
    /// Every plugin publishes into one shared aggregator endpoint
    #[default]
    Bridge,
    /// Every plugin gets an endpoint of its own
    ChildBridge,
}

impl BridgeMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BridgeMode::Bridge => "bridge",
            BridgeMode::ChildBridge => "childbridge",
        }
    }
}

impl fmt::Display for BridgeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BridgeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bridge" => Ok(BridgeMode::Bridge),
            "childbridge" | "child-bridge" => Ok(BridgeMode::ChildBridge),
            other => Err(format!("unknown bridge mode '{}'", other)),
        }
    }
}

/// Supervision and deferred timer settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimingSettings {
    pub supervision_interval: Duration,
    pub failure_ceiling: u32,
    pub configure_delay: Duration,
    pub reachable_delay: Duration,
    pub request_timeout: Duration,
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self {
            supervision_interval: constants::SUPERVISION_INTERVAL,
            failure_ceiling: constants::SUPERVISION_FAILURE_CEILING,
            configure_delay: constants::CONFIGURE_DELAY,
            reachable_delay: constants::REACHABLE_DELAY,
            request_timeout: constants::REQUEST_TIMEOUT,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TimingFile {
    supervision_interval_ms: Option<u64>,
    failure_ceiling: Option<u32>,
    configure_delay_ms: Option<u64>,
    reachable_delay_ms: Option<u64>,
    request_timeout_ms: Option<u64>,
}

impl TimingSettings {
    /// Read the `timing` section of the application configuration
    pub fn from_config(config: &ConfigData) -> Self {
        let defaults = Self::default();
        let Some(file) = config.get::<TimingFile>("timing") else {
            return defaults;
        };
        let ms = |value: Option<u64>, default: Duration| value.map(Duration::from_millis).unwrap_or(default);
        Self {
            supervision_interval: ms(file.supervision_interval_ms, defaults.supervision_interval),
            failure_ceiling: file.failure_ceiling.unwrap_or(defaults.failure_ceiling),
            configure_delay: ms(file.configure_delay_ms, defaults.configure_delay),
            reachable_delay: ms(file.reachable_delay_ms, defaults.reachable_delay),
            request_timeout: ms(file.request_timeout_ms, defaults.request_timeout),
        }
    }
}

/// Values given on the command line; they win over everything else
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BridgeOverrides {
    pub mode: Option<BridgeMode>,
    pub port: Option<u16>,
    pub passcode: Option<u32>,
    pub discriminator: Option<u16>,
    pub plugins_dir: Option<PathBuf>,
}

/// Effective settings of one orchestration run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeSettings {
    pub mode: BridgeMode,
    pub endpoint: EndpointDefaults,
    /// Extra plugin directories searched before the home plugin directory
    pub plugin_dirs: Vec<PathBuf>,
    pub timing: TimingSettings,
}

impl BridgeSettings {
    /// Apply command line, then the configuration file, then the persisted
    /// topology. A topology chosen on the command line is persisted.
    pub async fn resolve(
        overrides: &BridgeOverrides,
        config: &ConfigData,
        core: &StorageContext,
    ) -> StorageResult<Self> {
        let from_file = config
            .get::<String>("mode")
            .and_then(|value| match value.parse::<BridgeMode>() {
                Ok(mode) => Some(mode),
                Err(e) => {
                    log::warn!("Ignoring configured mode: {}", e);
                    None
                }
            });
        let persisted = core.get::<Option<BridgeMode>>(constants::BRIDGE_MODE_KEY, None).await?;

        let mode = match overrides.mode {
            Some(mode) => {
                core.set(constants::BRIDGE_MODE_KEY, &mode).await?;
                mode
            }
            None => from_file.or(persisted).unwrap_or_default(),
        };

        let endpoint = EndpointDefaults {
            port: overrides
                .port
                .or_else(|| config.get::<u16>("port"))
                .unwrap_or(constants::DEFAULT_PORT),
            passcode: overrides.passcode.or_else(|| config.get::<u32>("passcode")),
            discriminator: overrides.discriminator.or_else(|| config.get::<u16>("discriminator")),
        };

        let mut plugin_dirs = Vec::new();
        if let Some(dir) = &overrides.plugins_dir {
            plugin_dirs.push(dir.clone());
        }
        if let Some(dir) = config.get::<PathBuf>("pluginsDir") {
            plugin_dirs.push(dir);
        }

        Ok(Self {
            mode,
            endpoint,
            plugin_dirs,
            timing: TimingSettings::from_config(config),
        })
    }
}
