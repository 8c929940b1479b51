//! Heartbeat monitor: periodic reaping of clients that stopped calling in.

use super::ClientRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Process-liveness probe, injectable for tests.
pub trait PidProbe: Send + Sync {
    fn alive(&self, pid: u32) -> bool;
}

/// Probe backed by the local process table where one is observable.
pub struct SystemPidProbe;

impl PidProbe for SystemPidProbe {
    #[cfg(target_os = "linux")]
    fn alive(&self, pid: u32) -> bool {
        std::path::Path::new(&format!("/proc/{pid}")).exists()
    }

    /// Without a process table to consult, report alive and let the
    /// inactivity TTL do the reaping.
    #[cfg(not(target_os = "linux"))]
    fn alive(&self, _pid: u32) -> bool {
        true
    }
}

pub(super) fn spawn_monitor(
    registry: Arc<ClientRegistry>,
    check_interval_seconds: u64,
    inactive_seconds: u64,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(check_interval_seconds));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it so a restart does not
        // double-reap.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("client monitor stopped");
                    return;
                }
                _ = ticker.tick() => {
                    registry
                        .reap_inactive(inactive_seconds, check_interval_seconds)
                        .await;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{catalog_state, spec, RecordingScheduler};

    #[test]
    fn system_probe_sees_our_own_pid() {
        let probe = SystemPidProbe;
        assert!(probe.alive(std::process::id()));
    }

    #[tokio::test]
    async fn zero_interval_disables_the_monitor() {
        let mut state = catalog_state(1, vec![spec("git-server", &["git"])]);
        Arc::get_mut(&mut state)
            .unwrap()
            .summary
            .runtime
            .client_check_interval_seconds = 0;
        let registry = crate::registry::ClientRegistry::new(state, RecordingScheduler::new(), None);
        registry.start_monitor();
        assert_eq!(registry.monitor_interval_seconds(), None);
    }

    #[tokio::test]
    async fn monitor_restart_tracks_new_interval() {
        let state = catalog_state(1, vec![spec("git-server", &["git"])]);
        let registry = crate::registry::ClientRegistry::new(state, RecordingScheduler::new(), None);
        registry.start_monitor();
        assert!(registry.monitor_interval_seconds().is_some());

        let mut prev = crate::catalog::RuntimeConfig::default();
        let mut next = prev.clone();
        prev.client_check_interval_seconds = 5;
        next.client_check_interval_seconds = 9;

        // The registry restarts from its own catalog config, which still says
        // the default; the point here is that the old task was replaced.
        registry.update_runtime_config(&prev, &next);
        assert!(registry.monitor_interval_seconds().is_some());
        registry.stop_monitor();
        assert_eq!(registry.monitor_interval_seconds(), None);
    }
}
