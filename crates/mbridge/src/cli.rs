use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use mbridge_core::{BridgeMode, BridgeOverrides};

/// mbridge: plugin lifecycle orchestrator and bridge coordinator
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Home directory for storage, configuration and installed plugins
    #[arg(long, global = true, env = "MBRIDGE_HOME")]
    pub home: Option<PathBuf>,

    /// Extra directory searched for plugin manifests
    #[arg(long, global = true)]
    pub plugins_dir: Option<PathBuf>,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Register a plugin by name or path
    Add { plugin: String },
    /// Unregister a plugin
    Remove { plugin: String },
    /// Enable a plugin (persist setting)
    Enable { plugin: String },
    /// Disable a plugin (persist setting)
    Disable { plugin: String },
    /// List registered plugins
    List,
    /// Clear the network identity of a plugin, or of the shared bridge
    Reset { plugin: Option<String> },
    /// Remove every persisted context and configuration file
    #[command(name = "factoryreset")]
    FactoryReset,
    /// Install a plugin package and register it
    Install { package: String },
    /// Unregister a plugin and uninstall its package
    Uninstall { package: String },
    /// Orchestrate plugins until interrupted (default)
    Run(RunArgs),
}

#[derive(Args, Debug, Default, Clone)]
pub struct RunArgs {
    /// Expose every plugin through one shared endpoint
    #[arg(long, conflicts_with = "childbridge")]
    pub bridge: bool,

    /// Give every plugin its own endpoint
    #[arg(long)]
    pub childbridge: bool,

    /// Port of the first endpoint
    #[arg(long)]
    pub port: Option<u16>,

    /// Setup passcode of the shared bridge endpoint
    #[arg(long)]
    pub passcode: Option<u32>,

    /// Discriminator of the shared bridge endpoint
    #[arg(long)]
    pub discriminator: Option<u16>,
}

impl RunArgs {
    pub fn mode(&self) -> Option<BridgeMode> {
        match (self.bridge, self.childbridge) {
            (true, _) => Some(BridgeMode::Bridge),
            (_, true) => Some(BridgeMode::ChildBridge),
            _ => None,
        }
    }

    pub fn overrides(&self, plugins_dir: Option<PathBuf>) -> BridgeOverrides {
        BridgeOverrides {
            mode: self.mode(),
            port: self.port,
            passcode: self.passcode,
            discriminator: self.discriminator,
            plugins_dir,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        CliArgs::command().debug_assert();
    }

    #[test]
    fn test_run_flags_map_to_overrides() {
        let args = CliArgs::parse_from(["mbridge", "run", "--childbridge", "--port", "5600", "--passcode", "20202021"]);
        let Some(Command::Run(run)) = args.command else {
            panic!("expected run");
        };
        let overrides = run.overrides(None);
        assert_eq!(overrides.mode, Some(BridgeMode::ChildBridge));
        assert_eq!(overrides.port, Some(5600));
        assert_eq!(overrides.passcode, Some(20_202_021));
        assert_eq!(overrides.discriminator, None);
    }

    #[test]
    fn test_bridge_and_childbridge_conflict() {
        assert!(CliArgs::try_parse_from(["mbridge", "run", "--bridge", "--childbridge"]).is_err());
    }

    #[test]
    fn test_no_command_means_run() {
        let args = CliArgs::parse_from(["mbridge", "--home", "/tmp/mb"]);
        assert!(args.command.is_none());
        assert_eq!(args.home, Some(PathBuf::from("/tmp/mb")));
    }
}
