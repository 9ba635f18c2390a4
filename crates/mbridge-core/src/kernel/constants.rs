use std::time::Duration;

/// Application name
pub const APP_NAME: &str = "mbridge";

/// Application version
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Plugin API version checked against manifest compatibility ranges
pub const API_VERSION: &str = "1.0.0";

/// Package name of the core itself; installing it requires a full restart
pub const CORE_PACKAGE_NAME: &str = "mbridge";

/// Packages plugins must not depend on
pub const FORBIDDEN_DEPENDENCIES: &[&str] = &["mbridge", "mbridge-core"];

/// Manifest file expected in every plugin directory
pub const PLUGIN_MANIFEST_FILE: &str = "plugin.json";

/// Manifest `kind` marking a loadable platform module
pub const PLATFORM_MODULE_KIND: &str = "platform";

/// Environment variable overriding the home directory
pub const HOME_ENV_VAR: &str = "MBRIDGE_HOME";

/// Home directory name under the user's home
pub const DEFAULT_HOME_DIR_NAME: &str = ".mbridge";

/// Application configuration directory, relative to home
pub const APP_CONFIG_DIR: &str = "config";

/// Application configuration document name
pub const APP_CONFIG_NAME: &str = "mbridge";

/// Persistence context directory, relative to home
pub const STORAGE_DIR: &str = "storage";

/// Installed plugin packages, relative to home
pub const PLUGINS_DIR: &str = "plugins";

/// Core persistence namespace; always closed last
pub const CORE_CONTEXT: &str = "mbridge";

/// Key of the registered plugin list inside the core context
pub const PLUGINS_KEY: &str = "plugins";

/// Key of the persisted topology inside the core context
pub const BRIDGE_MODE_KEY: &str = "bridgeMode";

/// Bus address of the core
pub const CORE_CHANNEL: &str = "mbridge";

/// Bus address of the plugin manager
pub const PLUGINS_CHANNEL: &str = "plugins";

/// Bus address of the device registry
pub const DEVICES_CHANNEL: &str = "devices";

/// Bus address of the presentation layer
pub const FRONTEND_CHANNEL: &str = "frontend";

/// Destination matching every subscriber
pub const BROADCAST: &str = "*";

/// First port handed to server endpoints
pub const DEFAULT_PORT: u16 = 5540;

/// Vendor and product identifiers advertised by endpoints
pub const VENDOR_ID: u16 = 0xfff1;
pub const PRODUCT_ID: u16 = 0x8000;

/// Supervision check interval
pub const SUPERVISION_INTERVAL: Duration = Duration::from_secs(1);

/// Supervision checks before a still-unstarted plugin is forced into error
pub const SUPERVISION_FAILURE_CEILING: u32 = 60;

/// Delay between endpoint start and plugin configuration
pub const CONFIGURE_DELAY: Duration = Duration::from_secs(30);

/// Delay between endpoint start and the reachable announcement
pub const REACHABLE_DELAY: Duration = Duration::from_secs(60);

/// Default bus request timeout
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
