//! End-to-end behavior of a whole [`Application`] over a temporary home.
mod properties;
mod scenarios;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::endpoint::server::LocalServerFactory;
use crate::kernel::bootstrap::{Application, ExitReason};
use crate::kernel::constants;
use crate::kernel::error::Result;
use crate::tests::fixtures::{Behavior, Behaviors, TEST_ENTRY, app_options, write_plugin};

pub(super) const WAIT: Duration = Duration::from_secs(3);

/// One application and the in-process server nodes it created
pub(super) struct Running {
    pub app: Arc<Application>,
    pub factory: Arc<LocalServerFactory>,
    pub behaviors: Arc<Behaviors>,
}

impl Running {
    pub async fn boot(home: &Path, behaviors: Arc<Behaviors>) -> Self {
        let factory = Arc::new(LocalServerFactory::new());
        let (options, _) = app_options(home, behaviors.clone(), factory.clone());
        let app = Application::bootstrap(options).await.unwrap();
        app.initialize().await.unwrap();
        Self {
            app: Arc::new(app),
            factory,
            behaviors,
        }
    }

    pub async fn install(&self, name: &str, behavior: Behavior) {
        self.behaviors.set(name, behavior);
        write_plugin(&self.app.home().join(constants::PLUGINS_DIR), name, Some(TEST_ENTRY));
        self.app.plugin_manager().add(name).await.unwrap();
    }

    pub fn spawn(&self, cancel: &CancellationToken) -> JoinHandle<Result<ExitReason>> {
        let app = self.app.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { app.run(cancel).await })
    }

    pub async fn endpoint_ready(&self, id: &str) -> bool {
        let endpoints = self.app.endpoints().clone();
        let factory = self.factory.clone();
        let id = id.to_string();
        crate::tests::fixtures::eventually(WAIT, || {
            let endpoints = endpoints.clone();
            let factory = factory.clone();
            let id = id.clone();
            async move {
                endpoints.is_started(&id).await && factory.node(&id).is_some_and(|node| node.is_reachable())
            }
        })
        .await
    }
}
