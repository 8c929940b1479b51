//! In-process scheduler: one warm pool per spec fingerprint.
//!
//! Instances are rmcp clients over child-process stdio or streamable HTTP.
//! The pool scales to `desired_min_ready`, gates per-instance concurrency at
//! the spec's `max_concurrent`, reaps idle instances above the floor, and
//! forwards server notifications into the scheduler event stream.

use async_trait::async_trait;
use corral::catalog::{CatalogDiff, ServerSpec, SpecKey};
use corral::error::CoreError;
use corral::scheduler::{
    Instance, ListChangedKind, PoolInfo, Scheduler, ServerEvent, SinkChannel,
};
use rmcp::model::{ClientCapabilities, ClientInfo, Implementation, ProtocolVersion};
use rmcp::service::{NotificationContext, RoleClient, RunningService};
use rmcp::transport::child_process::TokioChildProcess;
use rmcp::transport::streamable_http_client::StreamableHttpClientTransportConfig;
use rmcp::transport::StreamableHttpClientTransport;
use rmcp::ClientHandler;
use rmcp::service::serve_client;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::collections::{BTreeMap, HashMap};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use which::which;

const EVENT_BUFFER: usize = 256;
const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Client handler that forwards list_changed notifications into the
/// scheduler event stream.
#[derive(Clone)]
struct NotifyingClientHandler {
    spec_key: SpecKey,
    events: broadcast::Sender<ServerEvent>,
}

impl ClientHandler for NotifyingClientHandler {
    fn get_info(&self) -> ClientInfo {
        ClientInfo::new(
            ClientCapabilities::default(),
            Implementation::new("corral", env!("CARGO_PKG_VERSION")),
        )
    }

    async fn on_tool_list_changed(&self, _context: NotificationContext<RoleClient>) {
        let _ = self.events.send(ServerEvent::ListChanged {
            spec_key: self.spec_key,
            kind: ListChangedKind::Tools,
        });
    }

    async fn on_resource_list_changed(&self, _context: NotificationContext<RoleClient>) {
        let _ = self.events.send(ServerEvent::ListChanged {
            spec_key: self.spec_key,
            kind: ListChangedKind::Resources,
        });
    }

    async fn on_prompt_list_changed(&self, _context: NotificationContext<RoleClient>) {
        let _ = self.events.send(ServerEvent::ListChanged {
            spec_key: self.spec_key,
            kind: ListChangedKind::Prompts,
        });
    }
}

struct PooledInstance {
    instance: Arc<Instance>,
    service: RunningService<RoleClient, NotifyingClientHandler>,
    in_use: u32,
    last_used: Instant,
}

struct SpecPool {
    key: SpecKey,
    spec: parking_lot::Mutex<Arc<ServerSpec>>,
    desired_min: AtomicU32,
    instances: Mutex<Vec<PooledInstance>>,
    /// Signalled on every release so saturated waiters re-check.
    released: Notify,
}

impl SpecPool {
    fn spec(&self) -> Arc<ServerSpec> {
        self.spec.lock().clone()
    }
}

struct SchedulerCore {
    pools: Mutex<HashMap<SpecKey, Arc<SpecPool>>>,
    specs: parking_lot::Mutex<BTreeMap<SpecKey, Arc<ServerSpec>>>,
    events: broadcast::Sender<ServerEvent>,
    handshake_timeout: Duration,
}

pub struct LocalScheduler {
    core: Arc<SchedulerCore>,
    idle_manager: parking_lot::Mutex<Option<CancellationToken>>,
    ping_manager: parking_lot::Mutex<Option<CancellationToken>>,
}

impl LocalScheduler {
    pub fn new(
        spec_registry: BTreeMap<SpecKey, Arc<ServerSpec>>,
        handshake_timeout: Duration,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Arc::new(Self {
            core: Arc::new(SchedulerCore {
                pools: Mutex::new(HashMap::new()),
                specs: parking_lot::Mutex::new(spec_registry),
                events,
                handshake_timeout,
            }),
            idle_manager: parking_lot::Mutex::new(None),
            ping_manager: parking_lot::Mutex::new(None),
        })
    }
}

impl SchedulerCore {
    async fn pool_for(&self, spec_key: SpecKey) -> Result<Arc<SpecPool>, CoreError> {
        let mut pools = self.pools.lock().await;
        if let Some(pool) = pools.get(&spec_key) {
            return Ok(Arc::clone(pool));
        }
        let spec = self
            .specs
            .lock()
            .get(&spec_key)
            .cloned()
            .ok_or_else(|| CoreError::Unavailable(format!("unknown spec {spec_key}")))?;
        let pool = Arc::new(SpecPool {
            key: spec_key,
            spec: parking_lot::Mutex::new(spec),
            desired_min: AtomicU32::new(0),
            instances: Mutex::new(Vec::new()),
            released: Notify::new(),
        });
        pools.insert(spec_key, Arc::clone(&pool));
        Ok(pool)
    }

    async fn launch_instance(&self, pool: &Arc<SpecPool>) -> Result<(), CoreError> {
        let spec = pool.spec();
        let handler = NotifyingClientHandler {
            spec_key: pool.key,
            events: self.events.clone(),
        };
        let service = tokio::time::timeout(self.handshake_timeout, start_client(&spec, handler))
            .await
            .map_err(|_| {
                CoreError::ConnectionClosed(format!("handshake timeout for '{}'", spec.name))
            })??;
        let sink = service.peer().clone();
        let instance = Arc::new(Instance::new(
            pool.key,
            &spec.name,
            Arc::new(SinkChannel(sink)),
        ));
        info!(server = %spec.name, instance = %instance.id, "instance ready");
        pool.instances.lock().await.push(PooledInstance {
            instance,
            service,
            in_use: 0,
            last_used: Instant::now(),
        });
        let _ = self.events.send(ServerEvent::InstanceReady { spec_key: pool.key });
        Ok(())
    }

    /// Borrow the least-loaded instance with free concurrency, if any.
    async fn try_take(&self, pool: &Arc<SpecPool>) -> Option<Arc<Instance>> {
        let max_concurrent = pool.spec().max_concurrent.max(1);
        let mut instances = pool.instances.lock().await;
        let candidate = instances
            .iter_mut()
            .filter(|pooled| pooled.in_use < max_concurrent)
            .min_by_key(|pooled| pooled.in_use)?;
        candidate.in_use += 1;
        candidate.last_used = Instant::now();
        Some(Arc::clone(&candidate.instance))
    }

    async fn stop_pool(&self, pool: Arc<SpecPool>, reason: &str) {
        let spec = pool.spec();
        let drained: Vec<PooledInstance> = pool.instances.lock().await.drain(..).collect();
        if drained.is_empty() {
            return;
        }
        info!(server = %spec.name, reason, count = drained.len(), "stopping instances");
        for pooled in drained {
            pooled.service.cancel().await.ok();
        }
        let _ = self.events.send(ServerEvent::SpecDown { spec_key: pool.key });
    }

    async fn set_desired_min_ready(&self, spec_key: SpecKey, n: u32) -> Result<(), CoreError> {
        let pool = self.pool_for(spec_key).await?;
        pool.desired_min.store(n, Ordering::SeqCst);
        loop {
            let current = pool.instances.lock().await.len();
            if current >= n as usize {
                return Ok(());
            }
            self.launch_instance(&pool).await?;
        }
    }

    async fn stop_spec(&self, spec_key: SpecKey, reason: &str) -> Result<(), CoreError> {
        let pool = self.pools.lock().await.remove(&spec_key);
        if let Some(pool) = pool {
            pool.desired_min.store(0, Ordering::SeqCst);
            self.stop_pool(pool, reason).await;
        }
        Ok(())
    }

    async fn reap_idle_once(&self) {
        let pools: Vec<Arc<SpecPool>> = self.pools.lock().await.values().cloned().collect();
        for pool in pools {
            let spec = pool.spec();
            let idle = Duration::from_secs(spec.idle_seconds.max(1));
            let floor = pool.desired_min.load(Ordering::SeqCst) as usize;
            let mut reaped = Vec::new();
            let now_empty = {
                let mut instances = pool.instances.lock().await;
                let mut index = 0;
                while index < instances.len() {
                    let above_floor = instances.len() > floor;
                    let pooled = &instances[index];
                    if above_floor && pooled.in_use == 0 && pooled.last_used.elapsed() > idle {
                        reaped.push(instances.remove(index));
                    } else {
                        index += 1;
                    }
                }
                instances.is_empty()
            };
            if reaped.is_empty() {
                continue;
            }
            for pooled in reaped {
                debug!(server = %spec.name, instance = %pooled.instance.id, "reaping idle instance");
                pooled.service.cancel().await.ok();
            }
            if now_empty {
                let _ = self.events.send(ServerEvent::SpecDown { spec_key: pool.key });
            }
        }
    }

    async fn ping_once(&self) {
        let pools: Vec<Arc<SpecPool>> = self.pools.lock().await.values().cloned().collect();
        for pool in pools {
            let spec = pool.spec();
            let probes: Vec<Arc<Instance>> = {
                let instances = pool.instances.lock().await;
                instances
                    .iter()
                    .filter(|pooled| pooled.in_use == 0)
                    .map(|pooled| Arc::clone(&pooled.instance))
                    .collect()
            };
            for instance in probes {
                let alive = tokio::time::timeout(PING_TIMEOUT, instance.channel.list_tools())
                    .await
                    .map(|result| result.is_ok())
                    .unwrap_or(false);
                if alive {
                    continue;
                }
                warn!(server = %spec.name, instance = %instance.id, "instance failed health probe");
                let removed = {
                    let mut instances = pool.instances.lock().await;
                    instances
                        .iter()
                        .position(|pooled| pooled.instance.id == instance.id)
                        .map(|index| instances.remove(index))
                };
                if let Some(pooled) = removed {
                    pooled.service.cancel().await.ok();
                    if pool.instances.lock().await.is_empty() {
                        let _ = self.events.send(ServerEvent::SpecDown { spec_key: pool.key });
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Scheduler for LocalScheduler {
    async fn acquire(
        &self,
        spec_key: SpecKey,
        _routing_key: &str,
    ) -> Result<Arc<Instance>, CoreError> {
        let pool = self.core.pool_for(spec_key).await?;
        if let Some(instance) = self.core.try_take(&pool).await {
            return Ok(instance);
        }
        // Cold pool: launch one on demand. A saturated pool fails fast; the
        // ready variant is the one that waits.
        if pool.instances.lock().await.is_empty() {
            self.core.launch_instance(&pool).await?;
            return self
                .core
                .try_take(&pool)
                .await
                .ok_or_else(|| CoreError::Unavailable("instance vanished after launch".into()));
        }
        Err(CoreError::Unavailable(format!(
            "pool for {spec_key} is saturated"
        )))
    }

    async fn acquire_ready(
        &self,
        spec_key: SpecKey,
        _routing_key: &str,
    ) -> Result<Arc<Instance>, CoreError> {
        let pool = self.core.pool_for(spec_key).await?;
        loop {
            // Register the waiter before checking availability: a release
            // landing between `try_take` and the await must not be lost
            // (`notify_waiters` stores no permit).
            let released = pool.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            if let Some(instance) = self.core.try_take(&pool).await {
                return Ok(instance);
            }
            if pool.instances.lock().await.is_empty() {
                self.core.launch_instance(&pool).await?;
                continue;
            }
            // Saturated: wait for a release. The caller bounds the overall
            // wait with its route timeout.
            released.await;
        }
    }

    async fn release(&self, instance: Arc<Instance>) -> Result<(), CoreError> {
        let pool = {
            let pools = self.core.pools.lock().await;
            pools.get(&instance.spec_key).cloned()
        };
        let Some(pool) = pool else {
            // Spec vanished while the call was in flight; nothing to return to.
            return Ok(());
        };
        let mut instances = pool.instances.lock().await;
        if let Some(pooled) = instances
            .iter_mut()
            .find(|pooled| pooled.instance.id == instance.id)
        {
            pooled.in_use = pooled.in_use.saturating_sub(1);
            pooled.last_used = Instant::now();
        }
        drop(instances);
        pool.released.notify_waiters();
        Ok(())
    }

    async fn apply_catalog_diff(
        &self,
        diff: &CatalogDiff,
        registry: &BTreeMap<SpecKey, Arc<ServerSpec>>,
    ) -> Result<(), CoreError> {
        *self.core.specs.lock() = registry.clone();

        for key in &diff.removed {
            self.core.stop_spec(*key, "removed from catalog").await?;
        }
        for key in diff.updated.iter().chain(diff.replaced.iter()) {
            if let Some(spec) = registry.get(key) {
                let pools = self.core.pools.lock().await;
                if let Some(pool) = pools.get(key) {
                    *pool.spec.lock() = Arc::clone(spec);
                }
            }
        }
        // Always-on specs warm up as soon as the catalog says they exist.
        for key in diff.added.iter().chain(diff.replaced.iter()) {
            if let Some(spec) = registry.get(key) {
                if spec.always_on() {
                    self.core
                        .set_desired_min_ready(*key, spec.effective_min_ready())
                        .await?;
                }
            }
        }
        Ok(())
    }

    async fn set_desired_min_ready(&self, spec_key: SpecKey, n: u32) -> Result<(), CoreError> {
        self.core.set_desired_min_ready(spec_key, n).await
    }

    async fn stop_spec(&self, spec_key: SpecKey, reason: &str) -> Result<(), CoreError> {
        self.core.stop_spec(spec_key, reason).await
    }

    fn start_idle_manager(&self, interval: Duration) {
        let mut slot = self.idle_manager.lock();
        if let Some(previous) = slot.take() {
            previous.cancel();
        }
        let cancel = CancellationToken::new();
        *slot = Some(cancel.clone());
        let core = Arc::clone(&self.core);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(interval) => core.reap_idle_once().await,
                }
            }
        });
    }

    fn stop_idle_manager(&self) {
        if let Some(cancel) = self.idle_manager.lock().take() {
            cancel.cancel();
        }
    }

    fn start_ping_manager(&self, interval: Duration) {
        let mut slot = self.ping_manager.lock();
        if let Some(previous) = slot.take() {
            previous.cancel();
        }
        let cancel = CancellationToken::new();
        *slot = Some(cancel.clone());
        let core = Arc::clone(&self.core);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(interval) => core.ping_once().await,
                }
            }
        });
    }

    fn stop_ping_manager(&self) {
        if let Some(cancel) = self.ping_manager.lock().take() {
            cancel.cancel();
        }
    }

    async fn stop_all(&self) {
        self.stop_idle_manager();
        self.stop_ping_manager();
        let pools: Vec<Arc<SpecPool>> =
            self.core.pools.lock().await.drain().map(|(_, pool)| pool).collect();
        for pool in pools {
            self.core.stop_pool(pool, "shutdown").await;
        }
    }

    async fn pool_status(&self) -> Vec<PoolInfo> {
        let pools: Vec<Arc<SpecPool>> = self.core.pools.lock().await.values().cloned().collect();
        let mut status = Vec::new();
        for pool in pools {
            let spec = pool.spec();
            let instances = pool.instances.lock().await;
            status.push(PoolInfo {
                spec_key: pool.key,
                server_name: spec.name.clone(),
                ready: instances.len(),
                in_use: instances.iter().filter(|pooled| pooled.in_use > 0).count(),
                desired_min_ready: pool.desired_min.load(Ordering::SeqCst),
            });
        }
        status.sort_by(|a, b| a.server_name.cmp(&b.server_name));
        status
    }

    fn events(&self) -> broadcast::Receiver<ServerEvent> {
        self.core.events.subscribe()
    }
}

async fn start_client(
    spec: &ServerSpec,
    handler: NotifyingClientHandler,
) -> Result<RunningService<RoleClient, NotifyingClientHandler>, CoreError> {
    match (&spec.command, &spec.http) {
        (Some(cmd), None) => {
            if which(&cmd.command).is_err() && !std::path::Path::new(&cmd.command).exists() {
                return Err(CoreError::ExecutableNotFound(cmd.command.clone()));
            }
            let mut command = tokio::process::Command::new(&cmd.command);
            command
                .args(&cmd.args)
                .envs(&spec.env)
                .stderr(Stdio::inherit())
                .stdout(Stdio::piped())
                .stdin(Stdio::piped());
            if let Some(cwd) = &spec.cwd {
                command.current_dir(cwd);
            }
            let transport = TokioChildProcess::new(command)
                .map_err(|e| CoreError::from_launch_io(&spec.name, &e))?;
            serve_client(handler, transport)
                .await
                .map_err(|e| CoreError::ConnectionClosed(e.to_string()))
        }
        (None, Some(http)) => {
            let transport = if http.headers.is_empty() {
                StreamableHttpClientTransport::from_uri(http.url.clone())
            } else {
                let mut default_headers = HeaderMap::new();
                for (name, value) in &http.headers {
                    let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                        CoreError::InvalidCommand {
                            server: spec.name.clone(),
                            reason: format!("bad header name '{name}': {e}"),
                        }
                    })?;
                    let value =
                        HeaderValue::from_str(value).map_err(|e| CoreError::InvalidCommand {
                            server: spec.name.clone(),
                            reason: format!("bad header value: {e}"),
                        })?;
                    default_headers.insert(name, value);
                }
                let client = reqwest::ClientBuilder::new()
                    .default_headers(default_headers)
                    .build()
                    .map_err(|e| CoreError::Internal(e.to_string()))?;
                StreamableHttpClientTransport::with_client(
                    client,
                    StreamableHttpClientTransportConfig::with_uri(http.url.clone()),
                )
            };
            serve_client(handler, transport)
                .await
                .map_err(|e| CoreError::ConnectionClosed(e.to_string()))
        }
        _ => Err(CoreError::InvalidCommand {
            server: spec.name.clone(),
            reason: "spec needs exactly one of command or http".into(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corral::catalog::{Catalog, CatalogState, CommandSpec};

    fn registry_with(specs: Vec<ServerSpec>) -> BTreeMap<SpecKey, Arc<ServerSpec>> {
        let servers: BTreeMap<String, ServerSpec> =
            specs.into_iter().map(|s| (s.name.clone(), s)).collect();
        CatalogState::new(
            Catalog {
                servers,
                ..Default::default()
            },
            1,
        )
        .summary
        .spec_registry
    }

    fn missing_binary_spec() -> ServerSpec {
        ServerSpec {
            name: "ghost".into(),
            command: Some(CommandSpec {
                command: "definitely-not-a-real-mcp-binary".into(),
                args: vec![],
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn unknown_spec_is_unavailable() {
        let scheduler = LocalScheduler::new(BTreeMap::new(), Duration::from_secs(5));
        let key = corral::hash::ContentHash::of_bytes(b"nope");
        let err = scheduler.acquire(key, "").await.unwrap_err();
        assert!(matches!(err, CoreError::Unavailable(_)));
    }

    #[tokio::test]
    async fn missing_executable_surfaces_as_launch_error() {
        let registry = registry_with(vec![missing_binary_spec()]);
        let key = *registry.keys().next().unwrap();
        let scheduler = LocalScheduler::new(registry, Duration::from_secs(5));

        let err = scheduler.set_desired_min_ready(key, 1).await.unwrap_err();
        assert!(matches!(err, CoreError::ExecutableNotFound(_)));
    }

    #[tokio::test]
    async fn stop_spec_on_empty_pool_is_idempotent() {
        let registry = registry_with(vec![missing_binary_spec()]);
        let key = *registry.keys().next().unwrap();
        let scheduler = LocalScheduler::new(registry, Duration::from_secs(5));
        scheduler.stop_spec(key, "test").await.unwrap();
        scheduler.stop_spec(key, "test").await.unwrap();
        assert!(scheduler.pool_status().await.is_empty());
    }

    #[tokio::test]
    async fn catalog_diff_replaces_the_spec_registry() {
        let old_registry = registry_with(vec![missing_binary_spec()]);
        let scheduler = LocalScheduler::new(old_registry.clone(), Duration::from_secs(5));

        let new_registry = registry_with(vec![ServerSpec {
            name: "other".into(),
            command: Some(CommandSpec {
                command: "also-missing".into(),
                args: vec![],
            }),
            ..Default::default()
        }]);
        let mut diff = CatalogDiff::default();
        diff.removed = old_registry.keys().copied().collect();
        diff.added = new_registry.keys().copied().collect();
        scheduler
            .apply_catalog_diff(&diff, &new_registry)
            .await
            .unwrap();

        let old_key = *old_registry.keys().next().unwrap();
        assert!(matches!(
            scheduler.acquire(old_key, "").await.unwrap_err(),
            CoreError::Unavailable(_)
        ));
    }
}
