//! Long-lived runtime state: per-entity snapshot caches, refresh, and call
//! dispatch. Survives catalog reloads; internal caches are replaced under
//! lock while readers keep loading consistent snapshots.

mod call;
mod entity;
mod items;
mod refresh;

pub use entity::{CatalogEntry, ETag, EntityCache, EntrySource, ServerSlice, Snapshot};
pub use items::{EntityItem, PromptEntry, ResourceEntry, ToolEntry};

use crate::catalog::{CatalogState, RuntimeConfig, SpecKey};
use crate::scheduler::Scheduler;
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;

/// The three parallel registries plus the shared dispatch plumbing.
pub struct RuntimeState {
    pub tools: EntityCache<ToolEntry>,
    pub resources: EntityCache<ResourceEntry>,
    pub prompts: EntityCache<PromptEntry>,
    scheduler: Arc<dyn Scheduler>,
    catalog: ArcSwap<CatalogState>,
    route_timeout_secs: AtomicU64,
    refresh_interval_secs: AtomicU64,
    refresh_limiter: Mutex<Arc<Semaphore>>,
    in_flight_refreshes: Mutex<HashSet<SpecKey>>,
}

impl RuntimeState {
    pub fn new(catalog: Arc<CatalogState>, scheduler: Arc<dyn Scheduler>) -> Arc<Self> {
        let runtime = &catalog.summary.runtime;
        let state = Self {
            tools: EntityCache::new(),
            resources: EntityCache::new(),
            prompts: EntityCache::new(),
            scheduler,
            route_timeout_secs: AtomicU64::new(runtime.route_timeout_seconds),
            refresh_interval_secs: AtomicU64::new(runtime.tool_refresh_seconds),
            refresh_limiter: Mutex::new(Arc::new(Semaphore::new(
                runtime.tool_refresh_concurrency.max(1),
            ))),
            in_flight_refreshes: Mutex::new(HashSet::new()),
            catalog: ArcSwap::from(catalog),
        };
        Arc::new(state)
    }

    pub fn current_catalog(&self) -> Arc<CatalogState> {
        self.catalog.load_full()
    }

    /// Swap in a new catalog: drop cache parts for specs that no longer
    /// exist. Entries for surviving specs stay until their next refresh.
    pub fn update_catalog(&self, state: &Arc<CatalogState>) {
        self.catalog.store(Arc::clone(state));
        let keep: BTreeSet<SpecKey> = state.summary.spec_registry.keys().copied().collect();
        self.tools.retain_specs(&keep);
        self.resources.retain_specs(&keep);
        self.prompts.retain_specs(&keep);
    }

    /// Hot-apply a runtime-config delta: timers and concurrency bounds.
    pub fn update_runtime_config(&self, prev: &RuntimeConfig, next: &RuntimeConfig) {
        self.route_timeout_secs
            .store(next.route_timeout_seconds, Ordering::Relaxed);
        self.refresh_interval_secs
            .store(next.tool_refresh_seconds, Ordering::Relaxed);
        if prev.tool_refresh_concurrency != next.tool_refresh_concurrency {
            *self.refresh_limiter.lock() =
                Arc::new(Semaphore::new(next.tool_refresh_concurrency.max(1)));
        }
    }

    pub fn route_timeout(&self) -> Duration {
        Duration::from_secs(self.route_timeout_secs.load(Ordering::Relaxed))
    }

    pub(crate) fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs.load(Ordering::Relaxed))
    }

    pub(crate) fn limiter(&self) -> Arc<Semaphore> {
        Arc::clone(&self.refresh_limiter.lock())
    }

    pub(crate) fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.scheduler
    }

    pub(crate) fn server_name_for(&self, key: &SpecKey) -> Option<String> {
        self.catalog
            .load()
            .summary
            .server_name_for_key(key)
            .map(String::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{catalog_state, spec, RecordingScheduler};

    #[test]
    fn update_catalog_retains_only_known_specs() {
        let state = catalog_state(1, vec![spec("git", &["git"]), spec("docker", &["docker"])]);
        let git = state.summary.server_spec_keys["git"];
        let docker = state.summary.server_spec_keys["docker"];
        let runtime = RuntimeState::new(Arc::clone(&state), RecordingScheduler::new());

        runtime.tools.set_spec_items(
            git,
            vec![ToolEntry {
                spec_key: git,
                server_name: "git".into(),
                name: "git_status".into(),
                description: None,
                input_schema: serde_json::json!({"type": "object"}),
                output_schema: None,
            }],
        );
        runtime.tools.set_spec_items(
            docker,
            vec![ToolEntry {
                spec_key: docker,
                server_name: "docker".into(),
                name: "docker_ps".into(),
                description: None,
                input_schema: serde_json::json!({"type": "object"}),
                output_schema: None,
            }],
        );
        assert_eq!(runtime.tools.snapshot().items.len(), 2);

        let next = catalog_state(2, vec![spec("git", &["git"])]);
        runtime.update_catalog(&next);
        assert_eq!(runtime.tools.snapshot().items.len(), 1);
        assert!(runtime.tools.resolve("docker_ps").is_none());
    }

    #[test]
    fn runtime_config_updates_apply_without_restart() {
        let state = catalog_state(1, vec![spec("git", &["git"])]);
        let runtime = RuntimeState::new(state, RecordingScheduler::new());
        let prev = RuntimeConfig::default();
        let mut next = prev.clone();
        next.route_timeout_seconds = 3;
        next.tool_refresh_seconds = 120;
        next.tool_refresh_concurrency = 9;

        runtime.update_runtime_config(&prev, &next);
        assert_eq!(runtime.route_timeout(), Duration::from_secs(3));
        assert_eq!(runtime.refresh_interval(), Duration::from_secs(120));
        assert_eq!(runtime.limiter().available_permits(), 9);
    }
}
