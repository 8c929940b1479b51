//! Transactional catalog reload.
//!
//! The reload manager owns the single-writer timeline from the catalog
//! provider: it alone swaps the active [`CatalogState`] and pushes deltas
//! into the scheduler, registry, runtime state and plugin host. A reload is
//! a sequence of idempotent steps; when one fails, the completed steps roll
//! back in reverse and every observable is back at its pre-reload value.

use crate::bootstrap::Bootstrap;
use crate::catalog::provider::CatalogProvider;
use crate::catalog::{CatalogDiff, CatalogState, ReloadMode};
use crate::error::CoreError;
use crate::plugins::PluginHost;
use crate::registry::ClientRegistry;
use crate::runtime::RuntimeState;
use crate::scheduler::Scheduler;
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const RELOAD_POLL: Duration = Duration::from_millis(10);

/// The ordered transaction steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    SchedulerApply,
    StateRegistry,
    Plugins,
    RuntimeConfig,
}

impl Step {
    const ALL: [Step; 4] = [
        Step::SchedulerApply,
        Step::StateRegistry,
        Step::Plugins,
        Step::RuntimeConfig,
    ];

    fn name(&self) -> &'static str {
        match self {
            Step::SchedulerApply => "scheduler_apply",
            Step::StateRegistry => "state_registry",
            Step::Plugins => "plugins",
            Step::RuntimeConfig => "runtime_config",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadResult {
    Applied,
    Skipped,
    RestartRequired,
    Rejected,
}

impl ReloadResult {
    fn as_str(&self) -> &'static str {
        match self {
            ReloadResult::Applied => "applied",
            ReloadResult::Skipped => "skipped",
            ReloadResult::RestartRequired => "restart-required",
            ReloadResult::Rejected => "rejected",
        }
    }
}

/// Record of the most recent reload attempt, surfaced to operators.
#[derive(Debug, Clone)]
pub struct ReloadOutcome {
    pub revision: u64,
    pub mode: ReloadMode,
    pub result: ReloadResult,
    pub stage: Option<&'static str>,
    pub error: Option<String>,
}

pub struct ReloadManager {
    provider: Arc<dyn CatalogProvider>,
    scheduler: Arc<dyn Scheduler>,
    registry: Arc<ClientRegistry>,
    runtime: Arc<RuntimeState>,
    plugins: Arc<dyn PluginHost>,
    bootstrap: Option<Arc<dyn Bootstrap>>,
    state: ArcSwap<CatalogState>,
    applied_rev: AtomicU64,
    last_outcome: Mutex<Option<ReloadOutcome>>,
    fatal_tx: Mutex<Option<mpsc::Sender<String>>>,
}

impl ReloadManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        provider: Arc<dyn CatalogProvider>,
        scheduler: Arc<dyn Scheduler>,
        registry: Arc<ClientRegistry>,
        runtime: Arc<RuntimeState>,
        plugins: Arc<dyn PluginHost>,
        bootstrap: Option<Arc<dyn Bootstrap>>,
    ) -> Arc<Self> {
        let initial = provider.current();
        let applied_rev = AtomicU64::new(initial.revision);
        Arc::new(Self {
            provider,
            scheduler,
            registry,
            runtime,
            plugins,
            bootstrap,
            state: ArcSwap::from(initial),
            applied_rev,
            last_outcome: Mutex::new(None),
            fatal_tx: Mutex::new(None),
        })
    }

    /// The catalog state every reader should use.
    pub fn current(&self) -> Arc<CatalogState> {
        self.state.load_full()
    }

    pub fn applied_revision(&self) -> u64 {
        self.applied_rev.load(Ordering::Acquire)
    }

    pub fn last_outcome(&self) -> Option<ReloadOutcome> {
        self.last_outcome.lock().clone()
    }

    /// In strict mode a failed apply sends its reason here; the daemon exits
    /// on receipt so a supervisor can remediate.
    pub fn fatal_signal(&self) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(1);
        *self.fatal_tx.lock() = Some(tx);
        rx
    }

    /// Consume the provider's update stream until cancelled.
    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) {
        let manager = Arc::clone(self);
        let mut updates = self.provider.watch();
        tokio::spawn(async move {
            loop {
                let update = tokio::select! {
                    _ = cancel.cancelled() => return,
                    update = updates.recv() => update,
                };
                match update {
                    Some(next) => {
                        manager.handle_update(next).await.ok();
                    }
                    None => return,
                }
            }
        });
    }

    /// Force the provider to re-read its source, then wait until the
    /// resulting revision has been applied (or definitively failed).
    pub async fn reload(&self) -> Result<u64, CoreError> {
        let next_rev = self.provider.force_reload().await?;
        loop {
            if self.applied_revision() >= next_rev {
                return Ok(next_rev);
            }
            if let Some(outcome) = self.last_outcome() {
                if outcome.revision >= next_rev {
                    match outcome.result {
                        ReloadResult::RestartRequired => {
                            return Err(CoreError::ReloadRestartRequired(
                                outcome.error.unwrap_or_default(),
                            ));
                        }
                        ReloadResult::Rejected => {
                            return Err(CoreError::ReloadRejected(
                                outcome.error.unwrap_or_default(),
                            ));
                        }
                        ReloadResult::Applied | ReloadResult::Skipped => {}
                    }
                }
            }
            tokio::time::sleep(RELOAD_POLL).await;
        }
    }

    /// Apply one provider update. Public for drivers that own their own
    /// update loop.
    pub async fn handle_update(&self, next: Arc<CatalogState>) -> Result<(), CoreError> {
        let prev = self.current();
        if next.revision < prev.revision {
            warn!(
                prev = prev.revision,
                next = next.revision,
                "ignoring non-monotonic catalog revision"
            );
            return Ok(());
        }
        let mode = prev.summary.runtime.reload_mode;
        let diff = CatalogDiff::between(&prev.summary, &next.summary);

        if diff.is_empty() {
            self.applied_rev.store(next.revision, Ordering::Release);
            self.record(ReloadOutcome {
                revision: next.revision,
                mode,
                result: ReloadResult::Skipped,
                stage: None,
                error: None,
            });
            return Ok(());
        }

        if diff.runtime.requires_restart() {
            let message = "runtime config change requires a restart".to_string();
            warn!(revision = next.revision, "{message}");
            self.record(ReloadOutcome {
                revision: next.revision,
                mode,
                result: ReloadResult::RestartRequired,
                stage: None,
                error: Some(message.clone()),
            });
            return Err(CoreError::ReloadRestartRequired(message));
        }

        let mut completed: Vec<Step> = Vec::new();
        for step in Step::ALL {
            match self.apply_step(step, &prev, &next, &diff).await {
                Ok(()) => completed.push(step),
                Err(err) => {
                    let mut messages = vec![format!("{}: {err}", step.name())];
                    for done in completed.iter().rev() {
                        if let Err(rollback_err) =
                            self.rollback_step(*done, &prev, &next, &diff).await
                        {
                            messages.push(format!(
                                "rollback {}: {rollback_err}",
                                done.name()
                            ));
                        }
                    }
                    let joined = messages.join("; ");
                    error!(
                        revision = next.revision,
                        mode = ?mode,
                        stage = step.name(),
                        error = %joined,
                        "catalog reload rejected"
                    );
                    self.record(ReloadOutcome {
                        revision: next.revision,
                        mode,
                        result: ReloadResult::Rejected,
                        stage: Some(step.name()),
                        error: Some(joined.clone()),
                    });
                    if mode == ReloadMode::Strict {
                        self.escalate(&joined).await;
                    }
                    return Err(CoreError::ReloadRejected(joined));
                }
            }
        }

        self.applied_rev.store(next.revision, Ordering::Release);
        info!(
            revision = next.revision,
            mode = ?mode,
            added = diff.added.len(),
            removed = diff.removed.len(),
            updated = diff.updated.len(),
            replaced = diff.replaced.len(),
            "catalog reload applied"
        );
        self.record(ReloadOutcome {
            revision: next.revision,
            mode,
            result: ReloadResult::Applied,
            stage: None,
            error: None,
        });

        if diff.touches_specs() {
            // Best-effort listing refresh for new and changed specs.
            let runtime = Arc::clone(&self.runtime);
            tokio::spawn(async move {
                runtime.refresh_all().await;
            });
        }
        Ok(())
    }

    async fn apply_step(
        &self,
        step: Step,
        prev: &Arc<CatalogState>,
        next: &Arc<CatalogState>,
        diff: &CatalogDiff,
    ) -> Result<(), CoreError> {
        match step {
            Step::SchedulerApply => {
                if diff.is_runtime_only() {
                    return Ok(());
                }
                self.scheduler
                    .apply_catalog_diff(diff, &next.summary.spec_registry)
                    .await?;
                if let Some(bootstrap) = &self.bootstrap {
                    bootstrap.push_catalog(next).await?;
                }
                Ok(())
            }
            Step::StateRegistry => {
                self.state.store(Arc::clone(next));
                if diff.runtime.changed || diff.touches_specs() || !diff.removed.is_empty() {
                    self.runtime.update_catalog(next);
                }
                self.registry.apply_catalog_update(next).await;
                Ok(())
            }
            Step::Plugins => {
                if diff.plugins.is_empty() {
                    return Ok(());
                }
                self.plugins.apply(&diff.plugins).await
            }
            Step::RuntimeConfig => {
                if !diff.runtime.changed {
                    return Ok(());
                }
                self.apply_runtime_delta(&prev.summary.runtime, &next.summary.runtime);
                Ok(())
            }
        }
    }

    async fn rollback_step(
        &self,
        step: Step,
        prev: &Arc<CatalogState>,
        next: &Arc<CatalogState>,
        diff: &CatalogDiff,
    ) -> Result<(), CoreError> {
        match step {
            Step::SchedulerApply => {
                if diff.is_runtime_only() {
                    return Ok(());
                }
                let reverse = CatalogDiff::between(&next.summary, &prev.summary);
                self.scheduler
                    .apply_catalog_diff(&reverse, &prev.summary.spec_registry)
                    .await?;
                if let Some(bootstrap) = &self.bootstrap {
                    bootstrap.push_catalog(prev).await?;
                }
                Ok(())
            }
            Step::StateRegistry => {
                self.state.store(Arc::clone(prev));
                self.runtime.update_catalog(prev);
                self.registry.apply_catalog_update(prev).await;
                Ok(())
            }
            Step::Plugins => {
                if diff.plugins.is_empty() {
                    return Ok(());
                }
                self.plugins.apply(&diff.plugins.reversed()).await
            }
            Step::RuntimeConfig => {
                if !diff.runtime.changed {
                    return Ok(());
                }
                self.apply_runtime_delta(&next.summary.runtime, &prev.summary.runtime);
                Ok(())
            }
        }
    }

    fn apply_runtime_delta(
        &self,
        from: &crate::catalog::RuntimeConfig,
        to: &crate::catalog::RuntimeConfig,
    ) {
        self.runtime.update_runtime_config(from, to);
        self.registry.update_runtime_config(from, to);
        if from.ping_interval_seconds != to.ping_interval_seconds {
            if to.ping_interval_seconds == 0 {
                self.scheduler.stop_ping_manager();
            } else {
                self.scheduler
                    .start_ping_manager(Duration::from_secs(to.ping_interval_seconds));
            }
        }
        if from.idle_check_interval_seconds != to.idle_check_interval_seconds {
            if to.idle_check_interval_seconds == 0 {
                self.scheduler.stop_idle_manager();
            } else {
                self.scheduler
                    .start_idle_manager(Duration::from_secs(to.idle_check_interval_seconds));
            }
        }
    }

    fn record(&self, outcome: ReloadOutcome) {
        info!(
            revision = outcome.revision,
            mode = ?outcome.mode,
            result = outcome.result.as_str(),
            stage = outcome.stage.unwrap_or(""),
            "reload outcome"
        );
        *self.last_outcome.lock() = Some(outcome);
    }

    async fn escalate(&self, reason: &str) {
        let tx = self.fatal_tx.lock().clone();
        match tx {
            Some(tx) => {
                let _ = tx.send(reason.to_string()).await;
            }
            None => {
                error!(reason, "strict reload failure with no fatal handler installed");
            }
        }
    }
}
