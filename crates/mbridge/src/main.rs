mod cli;
mod logging;
mod shutdown;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use log::info;

use mbridge_core::kernel::Result;
use mbridge_core::plugin_system::StaticPlatformLoader;
use mbridge_core::{Application, ApplicationOptions, BridgeOverrides, ExitReason, PluginSnapshot};

use crate::cli::{CliArgs, Command, RunArgs};

#[tokio::main]
async fn main() -> ExitCode {
    let args = CliArgs::parse();

    if let Err(e) = logging::init(&args.log_level, args.log_json) {
        eprintln!("Failed to initialize logging: {}", e);
        return ExitCode::FAILURE;
    }

    match execute(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn loader() -> Arc<StaticPlatformLoader> {
    let mut loader = StaticPlatformLoader::new();
    mbridge_sample_platforms::register(&mut loader);
    Arc::new(loader)
}

fn options(home: &Option<PathBuf>, overrides: BridgeOverrides) -> ApplicationOptions {
    let mut options = ApplicationOptions::new(loader()).overrides(overrides);
    if let Some(home) = home {
        options = options.home(home);
    }
    options
}

/// Bootstrap for a one-shot command: registry loaded, nothing started
async fn open(args: &CliArgs) -> Result<Application> {
    let overrides = BridgeOverrides {
        plugins_dir: args.plugins_dir.clone(),
        ..BridgeOverrides::default()
    };
    let app = Application::bootstrap(options(&args.home, overrides)).await?;
    app.initialize().await?;
    Ok(app)
}

async fn execute(args: CliArgs) -> Result<()> {
    match &args.command {
        None => orchestrate(&args, RunArgs::default()).await,
        Some(Command::Run(run)) => orchestrate(&args, run.clone()).await,
        Some(_) => one_shot(&args).await,
    }
}

async fn one_shot(args: &CliArgs) -> Result<()> {
    let app = open(args).await?;
    let outcome = dispatch(&app, args).await;
    app.close().await?;
    outcome
}

async fn dispatch(app: &Application, args: &CliArgs) -> Result<()> {
    let manager = app.plugin_manager();
    match &args.command {
        Some(Command::Add { plugin }) => {
            let added = manager.add(plugin).await?;
            println!("Added plugin '{}' v{}", added.name, added.version);
        }
        Some(Command::Remove { plugin }) => {
            let removed = manager.remove(plugin).await?;
            println!("Removed plugin '{}'", removed.name);
        }
        Some(Command::Enable { plugin }) => {
            let enabled = manager.enable(plugin).await?;
            println!("Enabled plugin '{}'", enabled.name);
        }
        Some(Command::Disable { plugin }) => {
            let disabled = manager.disable(plugin).await?;
            println!("Disabled plugin '{}'", disabled.name);
        }
        Some(Command::List) => print_plugins(&manager.list().await),
        Some(Command::Reset { plugin }) => {
            let endpoint = app.reset(plugin.as_deref()).await?;
            println!("Reset network identity of endpoint '{}'", endpoint);
        }
        Some(Command::FactoryReset) => {
            app.factory_reset().await?;
            println!("Factory reset of {} complete", app.home().display());
        }
        Some(Command::Install { package }) => match manager.install(package).await? {
            Some(installed) => println!("Installed plugin '{}' v{}", installed.name, installed.version),
            None => println!("Installed package '{}'; restart to apply", package),
        },
        Some(Command::Uninstall { package }) => {
            manager.uninstall(package).await?;
            println!("Uninstalled package '{}'", package);
        }
        Some(Command::Run(_)) | None => {}
    }
    Ok(())
}

fn print_plugins(plugins: &[PluginSnapshot]) {
    if plugins.is_empty() {
        println!("No plugins registered.");
        return;
    }
    for plugin in plugins {
        let state = if plugin.enabled { "enabled" } else { "disabled" };
        println!(
            "{} v{} [{}] {} ({})",
            plugin.name, plugin.version, state, plugin.platform_type, plugin.path.display()
        );
    }
}

/// Run until a signal arrives, bootstrapping afresh whenever a restart is requested
async fn orchestrate(args: &CliArgs, run: RunArgs) -> Result<()> {
    let cancel = shutdown::install_signal_handler();
    loop {
        let options = options(&args.home, run.overrides(args.plugins_dir.clone())).console(true);
        let app = Application::bootstrap(options).await?;
        info!("Starting in {} mode from {}", app.settings().mode, app.home().display());
        match app.run(cancel.clone()).await? {
            ExitReason::Shutdown => {
                info!("Shut down");
                return Ok(());
            }
            ExitReason::Restart => info!("Restarting"),
        }
    }
}
