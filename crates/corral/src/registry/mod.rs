//! Client registry: heartbeat-driven registration, visibility resolution,
//! reference-counted activation of specs, change broadcasting.
//!
//! Locking discipline: one mutex guards the whole map. Everything that needs
//! the lock — record upsert, refcount deltas, subscriber bookkeeping — happens
//! inside one critical section per operation; scheduler calls happen strictly
//! after release, using values copied out under the lock.

mod monitor;

pub use monitor::{PidProbe, SystemPidProbe};

use crate::bootstrap::Bootstrap;
use crate::catalog::{CatalogState, RuntimeConfig, SpecKey};
use crate::error::CoreError;
use crate::scheduler::Scheduler;
use crate::visibility;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Clients whose name carries this prefix observe without keeping servers
/// warm: they resolve visibility but are excluded from reference counts and
/// from broadcast snapshots.
pub const INTERNAL_PREFIX: &str = "internal:";

pub fn is_internal(name: &str) -> bool {
    name.starts_with(INTERNAL_PREFIX)
}

const ACTIVE_SUB_CAPACITY: usize = 1;
const CHANGE_SUB_CAPACITY: usize = 16;

/// One registered caller.
#[derive(Debug, Clone)]
pub struct ClientRecord {
    pub name: String,
    pub pid: u32,
    /// Normalized: lowercased, trimmed, deduped, sorted. Empty means "all".
    pub tags: Vec<String>,
    /// Server pin; mutually exclusive with tags.
    pub server: Option<String>,
    /// Resolved visibility, sorted.
    pub spec_keys: Vec<SpecKey>,
    pub last_heartbeat: Instant,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientInfo {
    pub name: String,
    pub pid: u32,
    pub tags: Vec<String>,
    pub server: Option<String>,
    pub spec_keys: Vec<SpecKey>,
}

/// Full view of non-internal clients, broadcast on every change.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ActiveClientSnapshot {
    pub clients: Vec<ClientInfo>,
}

/// Per-client delta, broadcast when a client's spec set changes.
#[derive(Debug, Clone, Serialize)]
pub struct ClientChangeEvent {
    pub client: String,
    pub spec_keys: Vec<SpecKey>,
    pub removed: bool,
}

/// Scheduling action computed under the lock, executed after release.
#[derive(Debug)]
enum PoolAction {
    Activate { key: SpecKey, min_ready: u32 },
    Deactivate { key: SpecKey },
}

struct Inner {
    catalog: Arc<CatalogState>,
    clients: HashMap<String, ClientRecord>,
    spec_counts: HashMap<SpecKey, usize>,
    active_subs: Vec<mpsc::Sender<ActiveClientSnapshot>>,
    change_subs: Vec<mpsc::Sender<ClientChangeEvent>>,
}

impl Inner {
    fn snapshot(&self) -> ActiveClientSnapshot {
        let mut clients: Vec<ClientInfo> = self
            .clients
            .values()
            .filter(|record| !is_internal(&record.name))
            .map(|record| ClientInfo {
                name: record.name.clone(),
                pid: record.pid,
                tags: record.tags.clone(),
                server: record.server.clone(),
                spec_keys: record.spec_keys.clone(),
            })
            .collect();
        clients.sort_by(|a, b| a.name.cmp(&b.name));
        ActiveClientSnapshot { clients }
    }

    /// Apply a +1/-1 refcount delta for one non-internal client's key sets,
    /// returning the pool actions caused by 0→1 / 1→0 transitions.
    fn apply_count_delta(
        &mut self,
        to_activate: &[SpecKey],
        to_deactivate: &[SpecKey],
    ) -> Vec<PoolAction> {
        let mut actions = Vec::new();
        for key in to_activate {
            let count = self.spec_counts.entry(*key).or_insert(0);
            *count += 1;
            if *count == 1 {
                let min_ready = self
                    .catalog
                    .summary
                    .spec_for_key(key)
                    .map(|spec| spec.effective_min_ready())
                    .unwrap_or(1);
                actions.push(PoolAction::Activate {
                    key: *key,
                    min_ready,
                });
            }
        }
        for key in to_deactivate {
            let remove = match self.spec_counts.get_mut(key) {
                Some(count) => {
                    *count = count.saturating_sub(1);
                    *count == 0
                }
                None => false,
            };
            if remove {
                self.spec_counts.remove(key);
                let always_on = self
                    .catalog
                    .summary
                    .spec_for_key(key)
                    .map(|spec| spec.always_on())
                    .unwrap_or(false);
                if !always_on {
                    actions.push(PoolAction::Deactivate { key: *key });
                }
            }
        }
        // Stable order keeps activation side effects deterministic.
        actions.sort_by_key(|a| match a {
            PoolAction::Activate { key, .. } | PoolAction::Deactivate { key } => *key,
        });
        actions
    }
}

struct MonitorHandle {
    cancel: CancellationToken,
    interval_seconds: u64,
}

/// The client registry. Cheap to share; all methods take `&self`.
pub struct ClientRegistry {
    inner: Mutex<Inner>,
    scheduler: Arc<dyn Scheduler>,
    bootstrap: Option<Arc<dyn Bootstrap>>,
    pid_probe: Arc<dyn PidProbe>,
    monitor: Mutex<Option<MonitorHandle>>,
}

impl ClientRegistry {
    pub fn new(
        catalog: Arc<CatalogState>,
        scheduler: Arc<dyn Scheduler>,
        bootstrap: Option<Arc<dyn Bootstrap>>,
    ) -> Arc<Self> {
        Self::with_pid_probe(catalog, scheduler, bootstrap, Arc::new(SystemPidProbe))
    }

    pub fn with_pid_probe(
        catalog: Arc<CatalogState>,
        scheduler: Arc<dyn Scheduler>,
        bootstrap: Option<Arc<dyn Bootstrap>>,
        pid_probe: Arc<dyn PidProbe>,
    ) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                catalog,
                clients: HashMap::new(),
                spec_counts: HashMap::new(),
                active_subs: Vec::new(),
                change_subs: Vec::new(),
            }),
            scheduler,
            bootstrap,
            pid_probe,
            monitor: Mutex::new(None),
        })
    }

    /// Register a caller, or refresh its heartbeat when nothing changed.
    ///
    /// Activation failures roll the registration back and propagate; the
    /// caller must retry from scratch.
    pub async fn register(
        &self,
        name: &str,
        pid: u32,
        tags: &[String],
        server: Option<&str>,
    ) -> Result<(), CoreError> {
        if name.is_empty() {
            return Err(CoreError::InvalidArgument("empty client name".into()));
        }
        if pid == 0 {
            return Err(CoreError::InvalidArgument("pid must be positive".into()));
        }
        let server = server.filter(|s| !s.is_empty());
        if server.is_some() && !tags.is_empty() {
            return Err(CoreError::InvalidArgument(
                "server pin and tags are mutually exclusive".into(),
            ));
        }
        let tags = visibility::normalize_tags(tags);
        let internal = is_internal(name);

        let (actions, broadcast) = {
            let mut inner = self.inner.lock();

            if let Some(existing) = inner.clients.get_mut(name) {
                let unchanged = existing.pid == pid
                    && existing.tags == tags
                    && existing.server.as_deref() == server;
                if unchanged {
                    existing.last_heartbeat = Instant::now();
                    return Ok(());
                }
            }

            let (spec_keys, matched) =
                visibility::resolve(&tags, server.unwrap_or(""), &inner.catalog.summary);
            debug!(client = name, servers = matched, "resolved client visibility");

            let old_keys = inner
                .clients
                .get(name)
                .map(|record| record.spec_keys.clone())
                .unwrap_or_default();
            let to_activate: Vec<SpecKey> = spec_keys
                .iter()
                .filter(|k| !old_keys.contains(k))
                .copied()
                .collect();
            let to_deactivate: Vec<SpecKey> = old_keys
                .iter()
                .filter(|k| !spec_keys.contains(k))
                .copied()
                .collect();

            let actions = if internal {
                Vec::new()
            } else {
                inner.apply_count_delta(&to_activate, &to_deactivate)
            };

            inner.clients.insert(
                name.to_string(),
                ClientRecord {
                    name: name.to_string(),
                    pid,
                    tags,
                    server: server.map(String::from),
                    spec_keys: spec_keys.clone(),
                    last_heartbeat: Instant::now(),
                },
            );

            let broadcast = if internal {
                None
            } else {
                Some((
                    inner.snapshot(),
                    ClientChangeEvent {
                        client: name.to_string(),
                        spec_keys,
                        removed: false,
                    },
                ))
            };
            (actions, broadcast)
        };

        if let Err(err) = self.run_pool_actions(&actions).await {
            warn!(client = name, error = %err, "activation failed, rolling back registration");
            self.unregister(name).await.ok();
            return Err(err);
        }

        if let Some((snapshot, change)) = broadcast {
            info!(client = name, pid, "client registered");
            self.broadcast(snapshot, vec![change]);
        }
        Ok(())
    }

    /// Remove a caller. Idempotent; deactivation failures are logged, never
    /// surfaced.
    pub async fn unregister(&self, name: &str) -> Result<(), CoreError> {
        let (actions, broadcast) = {
            let mut inner = self.inner.lock();
            let Some(record) = inner.clients.remove(name) else {
                return Ok(());
            };
            let actions = if is_internal(name) {
                Vec::new()
            } else {
                inner.apply_count_delta(&[], &record.spec_keys)
            };
            let broadcast = if is_internal(name) {
                None
            } else {
                Some((
                    inner.snapshot(),
                    ClientChangeEvent {
                        client: name.to_string(),
                        spec_keys: Vec::new(),
                        removed: true,
                    },
                ))
            };
            (actions, broadcast)
        };

        if let Err(err) = self.run_pool_actions(&actions).await {
            warn!(client = name, error = %err, "deactivation failed during unregister");
        }
        if let Some((snapshot, change)) = broadcast {
            info!(client = name, "client unregistered");
            self.broadcast(snapshot, vec![change]);
        }
        Ok(())
    }

    pub fn resolve_visible_spec_keys(&self, name: &str) -> Result<Vec<SpecKey>, CoreError> {
        let inner = self.inner.lock();
        inner
            .clients
            .get(name)
            .map(|record| record.spec_keys.clone())
            .ok_or_else(|| CoreError::ClientNotRegistered(name.to_string()))
    }

    pub fn resolve_client_server(&self, name: &str) -> Result<Option<String>, CoreError> {
        let inner = self.inner.lock();
        inner
            .clients
            .get(name)
            .map(|record| record.server.clone())
            .ok_or_else(|| CoreError::ClientNotRegistered(name.to_string()))
    }

    pub fn resolve_client_tags(&self, name: &str) -> Result<Vec<String>, CoreError> {
        let inner = self.inner.lock();
        inner
            .clients
            .get(name)
            .map(|record| record.tags.clone())
            .ok_or_else(|| CoreError::ClientNotRegistered(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.lock().clients.contains_key(name)
    }

    pub fn active_snapshot(&self) -> ActiveClientSnapshot {
        self.inner.lock().snapshot()
    }

    pub fn current_catalog(&self) -> Arc<CatalogState> {
        Arc::clone(&self.inner.lock().catalog)
    }

    /// Latest-value stream of the active-client set. Capacity 1; a slow
    /// subscriber loses intermediate snapshots, never the newest.
    pub fn watch_active_clients(&self) -> mpsc::Receiver<ActiveClientSnapshot> {
        let (tx, rx) = mpsc::channel(ACTIVE_SUB_CAPACITY);
        let mut inner = self.inner.lock();
        let _ = tx.try_send(inner.snapshot());
        inner.active_subs.push(tx);
        rx
    }

    /// Change-event stream. Capacity 16, drop-on-full.
    pub fn watch_client_changes(&self) -> mpsc::Receiver<ClientChangeEvent> {
        let (tx, rx) = mpsc::channel(CHANGE_SUB_CAPACITY);
        self.inner.lock().change_subs.push(tx);
        rx
    }

    /// Re-resolve every client against a new catalog, rebuild the counts from
    /// scratch, and apply the activation/deactivation delta between the old
    /// and new count maps.
    pub async fn apply_catalog_update(&self, update: &Arc<CatalogState>) {
        let (actions, snapshot, changes) = {
            let mut inner = self.inner.lock();
            inner.catalog = Arc::clone(update);
            let old_counts = std::mem::take(&mut inner.spec_counts);

            let mut changes = Vec::new();
            let names: Vec<String> = inner.clients.keys().cloned().collect();
            let mut new_counts: HashMap<SpecKey, usize> = HashMap::new();
            for name in names {
                let record = inner.clients.get(&name).expect("name collected under lock");
                let (spec_keys, _) = visibility::resolve(
                    &record.tags,
                    record.server.as_deref().unwrap_or(""),
                    &inner.catalog.summary,
                );
                let internal = is_internal(&name);
                if !internal {
                    for key in &spec_keys {
                        *new_counts.entry(*key).or_insert(0) += 1;
                    }
                }
                let record = inner.clients.get_mut(&name).expect("record exists");
                if record.spec_keys != spec_keys {
                    record.spec_keys = spec_keys.clone();
                    if !internal {
                        changes.push(ClientChangeEvent {
                            client: name.clone(),
                            spec_keys,
                            removed: false,
                        });
                    }
                }
            }
            inner.spec_counts = new_counts;

            let mut actions = Vec::new();
            let mut keys: Vec<SpecKey> = old_counts
                .keys()
                .chain(inner.spec_counts.keys())
                .copied()
                .collect();
            keys.sort_unstable();
            keys.dedup();
            for key in keys {
                let old = old_counts.get(&key).copied().unwrap_or(0);
                let new = inner.spec_counts.get(&key).copied().unwrap_or(0);
                if old == 0 && new > 0 {
                    let min_ready = inner
                        .catalog
                        .summary
                        .spec_for_key(&key)
                        .map(|spec| spec.effective_min_ready())
                        .unwrap_or(1);
                    actions.push(PoolAction::Activate { key, min_ready });
                } else if old > 0 && new == 0 {
                    let always_on = inner
                        .catalog
                        .summary
                        .spec_for_key(&key)
                        .map(|spec| spec.always_on())
                        .unwrap_or(false);
                    if !always_on {
                        actions.push(PoolAction::Deactivate { key });
                    }
                }
            }
            (actions, inner.snapshot(), changes)
        };

        if let Err(err) = self.run_pool_actions(&actions).await {
            warn!(error = %err, "pool adjustment failed during catalog update");
        }
        self.broadcast(snapshot, changes);
    }

    /// React to a runtime-config delta: restart the heartbeat monitor when
    /// its cadence changed.
    pub fn update_runtime_config(self: &Arc<Self>, prev: &RuntimeConfig, next: &RuntimeConfig) {
        if prev.client_check_interval_seconds != next.client_check_interval_seconds
            || prev.client_inactive_seconds != next.client_inactive_seconds
        {
            self.stop_monitor();
            self.start_monitor();
        }
    }

    /// Start the heartbeat reaper at the catalog's configured cadence. An
    /// interval of 0 disables it.
    pub fn start_monitor(self: &Arc<Self>) {
        let runtime = {
            let inner = self.inner.lock();
            inner.catalog.summary.runtime.clone()
        };
        let interval = runtime.client_check_interval_seconds;
        let mut slot = self.monitor.lock();
        if let Some(handle) = slot.take() {
            handle.cancel.cancel();
        }
        if interval == 0 {
            return;
        }
        let cancel = CancellationToken::new();
        monitor::spawn_monitor(
            Arc::clone(self),
            interval,
            runtime.client_inactive_seconds,
            cancel.clone(),
        );
        *slot = Some(MonitorHandle {
            cancel,
            interval_seconds: interval,
        });
    }

    pub fn stop_monitor(&self) {
        if let Some(handle) = self.monitor.lock().take() {
            handle.cancel.cancel();
        }
    }

    pub fn monitor_interval_seconds(&self) -> Option<u64> {
        self.monitor.lock().as_ref().map(|h| h.interval_seconds)
    }

    /// Reap one pass: clients past the inactivity TTL, or with a dead pid and
    /// a heartbeat older than twice the check interval.
    pub(crate) async fn reap_inactive(&self, inactive_seconds: u64, check_interval_seconds: u64) {
        let now = Instant::now();
        let victims: Vec<String> = {
            let inner = self.inner.lock();
            inner
                .clients
                .values()
                .filter(|record| {
                    let age = now.duration_since(record.last_heartbeat).as_secs_f64();
                    if age > inactive_seconds as f64 {
                        return true;
                    }
                    !self.pid_probe.alive(record.pid)
                        && age > 2.0 * check_interval_seconds as f64
                })
                .map(|record| record.name.clone())
                .collect()
        };
        for name in victims {
            info!(client = %name, "reaping inactive client");
            self.unregister(&name).await.ok();
        }
    }

    async fn run_pool_actions(&self, actions: &[PoolAction]) -> Result<(), CoreError> {
        let bootstrap_mode = {
            let inner = self.inner.lock();
            inner.catalog.summary.runtime.bootstrap_mode
        };
        for action in actions {
            match action {
                PoolAction::Activate { key, min_ready } => {
                    match (&self.bootstrap, bootstrap_mode) {
                        (Some(bootstrap), true) => {
                            bootstrap.set_desired_min_ready(*key, *min_ready).await?
                        }
                        _ => self.scheduler.set_desired_min_ready(*key, *min_ready).await?,
                    }
                }
                PoolAction::Deactivate { key } => {
                    self.scheduler.set_desired_min_ready(*key, 0).await?;
                    self.scheduler.stop_spec(*key, "client inactive").await?;
                }
            }
        }
        Ok(())
    }

    fn broadcast(&self, snapshot: ActiveClientSnapshot, changes: Vec<ClientChangeEvent>) {
        let mut inner = self.inner.lock();
        inner.active_subs.retain(|sub| match sub.try_send(snapshot.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
        for change in changes {
            inner.change_subs.retain(|sub| match sub.try_send(change.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => true,
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            });
        }
    }

    #[cfg(test)]
    pub(crate) fn spec_count(&self, key: SpecKey) -> Option<usize> {
        self.inner.lock().spec_counts.get(&key).copied()
    }

    #[cfg(test)]
    pub(crate) fn backdate_heartbeat(&self, name: &str, age: std::time::Duration) {
        let mut inner = self.inner.lock();
        if let Some(record) = inner.clients.get_mut(name) {
            record.last_heartbeat = Instant::now() - age;
        }
    }

    #[cfg(test)]
    pub(crate) fn assert_count_invariant(&self) {
        let inner = self.inner.lock();
        let mut expected: HashMap<SpecKey, usize> = HashMap::new();
        for record in inner.clients.values() {
            if is_internal(&record.name) {
                continue;
            }
            for key in &record.spec_keys {
                *expected.entry(*key).or_insert(0) += 1;
            }
        }
        assert_eq!(inner.spec_counts, expected, "spec_counts invariant violated");
    }
}
