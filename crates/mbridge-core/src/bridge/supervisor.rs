use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::bridge::mode::TimingSettings;
use crate::plugin_system::manager::PluginManager;
use crate::plugin_system::registry::PluginStatus;

/// How a supervision run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisionOutcome {
    /// Every supervised plugin reached `Started`
    AllStarted,
    /// A supervised plugin errored; supervision stopped at the first one seen
    Errored { plugin: String, reason: String },
    Cancelled,
}

/// Polls a set of plugins until all are started or one errors.
///
/// Each check that finds a plugin still starting counts against a shared
/// ceiling. Once the ceiling is passed, the plugins that have not started are
/// forced into `Errored`, which ends the run on the next check.
#[derive(Debug)]
pub struct Supervisor {
    manager: Arc<PluginManager>,
    plugins: Vec<String>,
    interval: Duration,
    ceiling: u32,
    cancel: CancellationToken,
}

impl Supervisor {
    pub fn new(
        manager: Arc<PluginManager>,
        plugins: Vec<String>,
        timing: &TimingSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            manager,
            plugins,
            interval: timing.supervision_interval,
            ceiling: timing.failure_ceiling,
            cancel,
        }
    }

    pub async fn run(self) -> SupervisionOutcome {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut failures: u32 = 0;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return SupervisionOutcome::Cancelled,
                _ = ticker.tick() => {}
            }

            // Plugins removed while supervised no longer hold anything up
            let statuses = self.manager.statuses(&self.plugins).await;
            if let Some((plugin, _)) = statuses
                .iter()
                .find(|(_, status)| *status == Some(PluginStatus::Errored))
            {
                let reason = self
                    .manager
                    .get(plugin)
                    .await
                    .and_then(|snapshot| snapshot.last_error)
                    .unwrap_or_else(|| "plugin errored".to_string());
                return SupervisionOutcome::Errored {
                    plugin: plugin.clone(),
                    reason,
                };
            }

            let pending: Vec<&String> = statuses
                .iter()
                .filter(|(_, status)| status.is_some_and(|s| !s.is_started()))
                .map(|(name, _)| name)
                .collect();
            if pending.is_empty() {
                return SupervisionOutcome::AllStarted;
            }

            failures += 1;
            if failures > self.ceiling {
                for plugin in pending {
                    let message = format!("did not start within {} checks", self.ceiling);
                    if let Err(e) = self.manager.mark_errored(plugin, &message).await {
                        log::warn!("Could not mark plugin '{}' as errored: {}", plugin, e);
                    }
                }
            } else {
                log::debug!(
                    "Waiting for {} plugin(s) to start ({}/{})",
                    pending.len(),
                    failures,
                    self.ceiling
                );
            }
        }
    }
}
