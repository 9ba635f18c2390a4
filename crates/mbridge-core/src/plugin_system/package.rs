use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::process::Command;

use crate::plugin_system::error::PluginSystemError;

/// Host package manager. Any failure is total; nothing is rolled back.
#[async_trait]
pub trait PackageManager: Send + Sync + fmt::Debug {
    async fn install(&self, package: &str) -> Result<(), PluginSystemError>;

    async fn uninstall(&self, package: &str) -> Result<(), PluginSystemError>;
}

/// Runs an external command per operation.
///
/// Argument templates may use `{package}` and `{prefix}`.
#[derive(Debug, Clone)]
pub struct CommandPackageManager {
    program: String,
    install_args: Vec<String>,
    uninstall_args: Vec<String>,
    prefix: PathBuf,
}

impl CommandPackageManager {
    pub fn new(program: &str, install_args: &[&str], uninstall_args: &[&str], prefix: PathBuf) -> Self {
        Self {
            program: program.to_string(),
            install_args: install_args.iter().map(|s| s.to_string()).collect(),
            uninstall_args: uninstall_args.iter().map(|s| s.to_string()).collect(),
            prefix,
        }
    }

    /// `npm install|uninstall --prefix <prefix> <package>`
    pub fn npm(prefix: PathBuf) -> Self {
        Self::new(
            "npm",
            &["install", "--prefix", "{prefix}", "{package}"],
            &["uninstall", "--prefix", "{prefix}", "{package}"],
            prefix,
        )
    }

    pub fn prefix(&self) -> &PathBuf {
        &self.prefix
    }

    fn expand(&self, template: &[String], package: &str) -> Vec<String> {
        let prefix = self.prefix.display().to_string();
        template
            .iter()
            .map(|arg| arg.replace("{package}", package).replace("{prefix}", &prefix))
            .collect()
    }

    async fn run(&self, operation: &str, args: Vec<String>, package: &str) -> Result<(), PluginSystemError> {
        log::info!("Running {} {}", self.program, args.join(" "));
        let failed = |message: String| PluginSystemError::PackageFailed {
            package: package.to_string(),
            operation: operation.to_string(),
            message,
        };
        let output = Command::new(&self.program)
            .args(&args)
            .output()
            .await
            .map_err(|e| failed(format!("could not run {}: {}", self.program, e)))?;

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(failed(format!("{} ({})", output.status, stderr.trim())))
        }
    }
}

#[async_trait]
impl PackageManager for CommandPackageManager {
    async fn install(&self, package: &str) -> Result<(), PluginSystemError> {
        let args = self.expand(&self.install_args, package);
        self.run("install", args, package).await
    }

    async fn uninstall(&self, package: &str) -> Result<(), PluginSystemError> {
        let args = self.expand(&self.uninstall_args, package);
        self.run("uninstall", args, package).await
    }
}
