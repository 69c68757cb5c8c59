//! Helper VM watchdog.
//!
//! The helper keeps no durable state. When it comes back after being
//! unreachable, or reports a lower uptime than before (it restarted between
//! polls), its bridges and ports are rebuilt from the registry.

use std::sync::Arc;
use std::time::Duration;

use skiff_common::SkiffResult;
use skiff_network::NetworkRegistry;
use skiff_network::rpc::HelperClient;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// What one health poll saw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelperState {
    /// No answer, or an unhealthy one.
    Unreachable,
    /// Healthy, up for `uptime` seconds.
    Up {
        /// Seconds since the helper started.
        uptime: u64,
    },
}

/// Whether the transition from `previous` to `current` lost helper state.
#[must_use]
pub const fn needs_recovery(previous: HelperState, current: HelperState) -> bool {
    match (previous, current) {
        (_, HelperState::Unreachable) => false,
        (HelperState::Unreachable, HelperState::Up { .. }) => true,
        (HelperState::Up { uptime: before }, HelperState::Up { uptime: now }) => now < before,
    }
}

/// Polls helper health and reconciles the registry after helper restarts.
pub struct HelperWatchdog {
    registry: Arc<NetworkRegistry>,
    helper: HelperClient,
    interval: Duration,
}

impl HelperWatchdog {
    /// Watch `helper` every `interval` on behalf of `registry`.
    #[must_use]
    pub const fn new(registry: Arc<NetworkRegistry>, helper: HelperClient, interval: Duration) -> Self {
        Self {
            registry,
            helper,
            interval,
        }
    }

    /// Poll the helper once.
    pub async fn probe(&self) -> HelperState {
        match self.helper.health().await {
            Ok(health) if health.healthy => HelperState::Up {
                uptime: health.uptime_seconds,
            },
            Ok(health) => {
                tracing::debug!(
                    backend = %health.backend,
                    status = %health.backend_status,
                    "Helper reports unhealthy"
                );
                HelperState::Unreachable
            }
            Err(e) => {
                tracing::debug!(error = %e, "Helper health check failed");
                HelperState::Unreachable
            }
        }
    }

    /// Make sure the default network exists and rebuild the helper from
    /// the registry. Returns how many attachments were re-plumbed.
    ///
    /// # Errors
    ///
    /// The helper's error when the default network cannot be created or
    /// no bridge could be rebuilt.
    pub async fn recover(&self) -> SkiffResult<usize> {
        self.registry.ensure_default_network().await?;
        self.registry.reconcile().await
    }

    /// Poll until `cancel` fires, starting from what startup saw.
    pub async fn run(self, initial: HelperState, cancel: CancellationToken) {
        let mut previous = initial;
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let mut current = self.probe().await;
            if current != previous {
                tracing::info!(?previous, ?current, "Helper state changed");
            }
            if needs_recovery(previous, current) {
                match self.recover().await {
                    Ok(replumbed) => tracing::info!(replumbed, "Helper rebuilt from registry"),
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to rebuild helper, retrying on next poll");
                        current = HelperState::Unreachable;
                    }
                }
            }
            previous = current;
        }
        tracing::debug!("Helper watchdog stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skiff_network::helper::{HelperService, LearningSwitch, NameResolutionManager, NullFilter, NullResolver};
    use skiff_network::naming::BridgeNaming;
    use skiff_network::runtime::LoopbackRuntime;
    use skiff_network::transport::LoopbackHub;
    use skiff_network::{ChannelBinder, DataPlane, NetworkConfig, RetryPolicy, VmDataPlane};

    const UP_5: HelperState = HelperState::Up { uptime: 5 };
    const UP_9: HelperState = HelperState::Up { uptime: 9 };

    #[test]
    fn recovery_decisions() {
        assert!(needs_recovery(HelperState::Unreachable, UP_5));
        assert!(needs_recovery(UP_9, UP_5));
        assert!(!needs_recovery(UP_5, UP_9));
        assert!(!needs_recovery(UP_5, UP_5));
        assert!(!needs_recovery(UP_5, HelperState::Unreachable));
        assert!(!needs_recovery(HelperState::Unreachable, HelperState::Unreachable));
    }

    fn watchdog(hub: &LoopbackHub) -> (HelperWatchdog, Arc<NetworkRegistry>) {
        let mut config = NetworkConfig::default().with_retry(RetryPolicy::none());
        config.rpc_timeout_ms = 1_000;
        let plane = Arc::new(VmDataPlane::new(
            config.clone(),
            Arc::new(LoopbackRuntime::new(hub.clone())),
            Arc::new(hub.channel("helper")),
        ));
        let helper = plane.helper().clone();
        let registry = Arc::new(NetworkRegistry::new(config, plane as Arc<dyn DataPlane>));
        let watchdog = HelperWatchdog::new(Arc::clone(&registry), helper, Duration::from_millis(10));
        (watchdog, registry)
    }

    #[test_log::test(tokio::test)]
    async fn missing_helper_is_unreachable() {
        let hub = LoopbackHub::new();
        let (watchdog, _) = watchdog(&hub);
        assert_eq!(watchdog.probe().await, HelperState::Unreachable);
    }

    #[test_log::test(tokio::test)]
    async fn recovery_rebuilds_the_default_network() {
        let hub = LoopbackHub::new();
        let dir = tempfile::tempdir().unwrap();
        let helper = HelperService::new(
            Arc::new(LearningSwitch::new()),
            Arc::new(hub.binder("helper")),
            Arc::new(NameResolutionManager::new(
                dir.path(),
                Vec::new(),
                Arc::new(NullResolver::default()),
            )),
            Arc::new(NullFilter::default()),
            BridgeNaming::default(),
        );
        let listener = hub
            .binder("helper")
            .bind(NetworkConfig::default().helper.control_port)
            .await
            .unwrap();
        let stop = CancellationToken::new();
        tokio::spawn(helper.clone().serve(listener, stop.clone().cancelled_owned()));

        let (watchdog, registry) = watchdog(&hub);
        assert!(matches!(watchdog.probe().await, HelperState::Up { .. }));

        assert_eq!(watchdog.recover().await.unwrap(), 0);
        assert_eq!(registry.list_networks().len(), 1);
        assert_eq!(helper.bridges().await.len(), 1);

        // A helper that lost its bridges gets them back.
        helper.shutdown().await;
        assert!(helper.bridges().await.is_empty());
        watchdog.recover().await.unwrap();
        assert_eq!(helper.bridges().await.len(), 1);
        stop.cancel();
    }
}
