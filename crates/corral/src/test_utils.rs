//! Shared fakes for subsystem tests: a recording scheduler, canned instance
//! channels, a static catalog provider, and builders for specs and catalogs.

use crate::bootstrap::Bootstrap;
use crate::catalog::provider::CatalogProvider;
use crate::catalog::{
    Catalog, CatalogDiff, CatalogState, CommandSpec, PluginDiff, ServerSpec, SpecKey,
};
use crate::error::CoreError;
use crate::plugins::PluginHost;
use crate::registry::PidProbe;
use crate::scheduler::{
    Instance, InstanceChannel, PoolInfo, Scheduler, ServerEvent,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use rmcp::model::{
    CallToolResult, Content, GetPromptResult, JsonObject, Prompt, PromptMessage,
    PromptMessageRole, RawResource, ReadResourceResult, ResourceContents, Tool,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

// ── Builders ────────────────────────────────────────────────────────────────

pub fn spec(name: &str, tags: &[&str]) -> ServerSpec {
    ServerSpec {
        name: name.into(),
        command: Some(CommandSpec {
            command: "mcp-server".into(),
            args: vec![name.into()],
        }),
        tags: tags.iter().map(|t| t.to_string()).collect(),
        ..Default::default()
    }
}

pub fn catalog_state(revision: u64, specs: Vec<ServerSpec>) -> Arc<CatalogState> {
    let servers: BTreeMap<String, ServerSpec> =
        specs.into_iter().map(|s| (s.name.clone(), s)).collect();
    Arc::new(CatalogState::new(
        Catalog {
            servers,
            ..Default::default()
        },
        revision,
    ))
}

pub fn tool(name: &str) -> Tool {
    Tool::new(
        name.to_string(),
        format!("test tool {name}"),
        Arc::new(JsonObject::new()),
    )
}

pub fn resource(uri: &str, name: &str) -> RawResource {
    RawResource::new(uri, name.to_string())
}

pub fn prompt(name: &str) -> Prompt {
    Prompt::new(name, Some("test prompt"), None)
}

// ── Instance channel fake ───────────────────────────────────────────────────

/// Canned JSON-RPC surface: fixed listings, echoing calls, optional latency.
#[derive(Default)]
pub struct FakeChannel {
    pub tools: Vec<Tool>,
    pub resources: Vec<RawResource>,
    pub prompts: Vec<Prompt>,
    /// Injected latency before every response, for timeout tests.
    pub delay: Option<Duration>,
    /// When set, every method fails with this error.
    pub fail_with: Option<CoreError>,
}

impl FakeChannel {
    pub fn with_tools(tools: Vec<Tool>) -> Self {
        Self {
            tools,
            ..Default::default()
        }
    }

    async fn gate(&self) -> Result<(), CoreError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match &self.fail_with {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl InstanceChannel for FakeChannel {
    async fn list_tools(&self) -> Result<Vec<Tool>, CoreError> {
        self.gate().await?;
        Ok(self.tools.clone())
    }

    async fn list_resources(&self) -> Result<Vec<RawResource>, CoreError> {
        self.gate().await?;
        Ok(self.resources.clone())
    }

    async fn list_prompts(&self) -> Result<Vec<Prompt>, CoreError> {
        self.gate().await?;
        Ok(self.prompts.clone())
    }

    async fn call_tool(
        &self,
        name: &str,
        _arguments: Option<JsonObject>,
    ) -> Result<CallToolResult, CoreError> {
        self.gate().await?;
        Ok(CallToolResult::success(vec![Content::text(format!(
            "called {name}"
        ))]))
    }

    async fn read_resource(&self, uri: &str) -> Result<ReadResourceResult, CoreError> {
        self.gate().await?;
        Ok(ReadResourceResult {
            contents: vec![ResourceContents::text(format!("contents of {uri}"), uri)],
        })
    }

    async fn get_prompt(
        &self,
        name: &str,
        _arguments: Option<JsonObject>,
    ) -> Result<GetPromptResult, CoreError> {
        self.gate().await?;
        Ok(GetPromptResult {
            description: Some(format!("prompt {name}")),
            messages: vec![PromptMessage::new_text(
                PromptMessageRole::User,
                format!("prompt {name}"),
            )],
        })
    }
}

// ── Recording scheduler ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum SchedCall {
    SetDesiredMinReady { spec_key: SpecKey, n: u32 },
    StopSpec { spec_key: SpecKey, reason: String },
    ApplyCatalogDiff { added: usize, removed: usize, replaced: usize },
    Acquire { spec_key: SpecKey },
    Release { spec_key: SpecKey },
    StopAll,
}

/// Scheduler fake that records every interaction and can hand out instances
/// backed by [`FakeChannel`]s.
pub struct RecordingScheduler {
    pub calls: Mutex<Vec<SchedCall>>,
    /// Spec keys whose `set_desired_min_ready` should fail.
    pub fail_min_ready: Mutex<HashSet<SpecKey>>,
    channels: Mutex<HashMap<SpecKey, (String, Arc<dyn InstanceChannel>)>>,
    events: broadcast::Sender<ServerEvent>,
}

impl RecordingScheduler {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            fail_min_ready: Mutex::new(HashSet::new()),
            channels: Mutex::new(HashMap::new()),
            events,
        })
    }

    /// Make `acquire`/`acquire_ready` for `spec_key` hand out instances
    /// backed by `channel`.
    pub fn register_channel(
        &self,
        spec_key: SpecKey,
        server_name: &str,
        channel: Arc<dyn InstanceChannel>,
    ) {
        self.channels
            .lock()
            .insert(spec_key, (server_name.to_string(), channel));
    }

    pub fn emit(&self, event: ServerEvent) {
        let _ = self.events.send(event);
    }

    pub fn min_ready_calls(&self, key: SpecKey) -> Vec<u32> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                SchedCall::SetDesiredMinReady { spec_key, n } if *spec_key == key => Some(*n),
                _ => None,
            })
            .collect()
    }

    pub fn stop_calls(&self, key: SpecKey) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                SchedCall::StopSpec { spec_key, reason } if *spec_key == key => {
                    Some(reason.clone())
                }
                _ => None,
            })
            .collect()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl Scheduler for RecordingScheduler {
    async fn acquire(
        &self,
        spec_key: SpecKey,
        _routing_key: &str,
    ) -> Result<Arc<Instance>, CoreError> {
        self.calls.lock().push(SchedCall::Acquire { spec_key });
        let channels = self.channels.lock();
        match channels.get(&spec_key) {
            Some((server_name, channel)) => Ok(Arc::new(Instance::new(
                spec_key,
                server_name,
                Arc::clone(channel),
            ))),
            None => Err(CoreError::Unavailable(format!(
                "no instance for {spec_key}"
            ))),
        }
    }

    async fn acquire_ready(
        &self,
        spec_key: SpecKey,
        routing_key: &str,
    ) -> Result<Arc<Instance>, CoreError> {
        self.acquire(spec_key, routing_key).await
    }

    async fn release(&self, instance: Arc<Instance>) -> Result<(), CoreError> {
        self.calls.lock().push(SchedCall::Release {
            spec_key: instance.spec_key,
        });
        Ok(())
    }

    async fn apply_catalog_diff(
        &self,
        diff: &CatalogDiff,
        _registry: &BTreeMap<SpecKey, Arc<ServerSpec>>,
    ) -> Result<(), CoreError> {
        self.calls.lock().push(SchedCall::ApplyCatalogDiff {
            added: diff.added.len(),
            removed: diff.removed.len(),
            replaced: diff.replaced.len(),
        });
        Ok(())
    }

    async fn set_desired_min_ready(&self, spec_key: SpecKey, n: u32) -> Result<(), CoreError> {
        self.calls
            .lock()
            .push(SchedCall::SetDesiredMinReady { spec_key, n });
        if self.fail_min_ready.lock().contains(&spec_key) {
            return Err(CoreError::Unavailable("pool refused".into()));
        }
        Ok(())
    }

    async fn stop_spec(&self, spec_key: SpecKey, reason: &str) -> Result<(), CoreError> {
        self.calls.lock().push(SchedCall::StopSpec {
            spec_key,
            reason: reason.to_string(),
        });
        Ok(())
    }

    fn start_idle_manager(&self, _interval: Duration) {}
    fn stop_idle_manager(&self) {}
    fn start_ping_manager(&self, _interval: Duration) {}
    fn stop_ping_manager(&self) {}

    async fn stop_all(&self) {
        self.calls.lock().push(SchedCall::StopAll);
    }

    async fn pool_status(&self) -> Vec<PoolInfo> {
        Vec::new()
    }

    fn events(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }
}

// ── Catalog provider fake ───────────────────────────────────────────────────

pub struct StaticProvider {
    current: Mutex<Arc<CatalogState>>,
    senders: Mutex<Vec<mpsc::Sender<Arc<CatalogState>>>>,
}

impl StaticProvider {
    pub fn new(initial: Arc<CatalogState>) -> Arc<Self> {
        Arc::new(Self {
            current: Mutex::new(initial),
            senders: Mutex::new(Vec::new()),
        })
    }

    /// Publish a new snapshot to the watcher.
    pub async fn push(&self, state: Arc<CatalogState>) {
        *self.current.lock() = Arc::clone(&state);
        let senders = self.senders.lock().clone();
        for sender in senders {
            let _ = sender.send(Arc::clone(&state)).await;
        }
    }
}

#[async_trait]
impl CatalogProvider for StaticProvider {
    fn current(&self) -> Arc<CatalogState> {
        Arc::clone(&self.current.lock())
    }

    fn watch(&self) -> mpsc::Receiver<Arc<CatalogState>> {
        let (tx, rx) = mpsc::channel(16);
        self.senders.lock().push(tx);
        rx
    }

    async fn force_reload(&self) -> Result<u64, CoreError> {
        let state = self.current();
        let senders = self.senders.lock().clone();
        for sender in senders {
            let _ = sender.send(Arc::clone(&state)).await;
        }
        Ok(state.revision)
    }
}

// ── Plugin / bootstrap / pid fakes ──────────────────────────────────────────

#[derive(Default)]
pub struct RecordingPluginHost {
    pub applied: Mutex<Vec<PluginDiff>>,
    pub fail: Mutex<bool>,
}

#[async_trait]
impl PluginHost for RecordingPluginHost {
    async fn apply(&self, diff: &PluginDiff) -> Result<(), CoreError> {
        self.applied.lock().push(diff.clone());
        if *self.fail.lock() {
            return Err(CoreError::Internal("plugin apply failed".into()));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingBootstrap {
    pub min_ready: Mutex<Vec<(SpecKey, u32)>>,
    pub catalogs: Mutex<Vec<u64>>,
}

#[async_trait]
impl Bootstrap for RecordingBootstrap {
    async fn set_desired_min_ready(&self, spec_key: SpecKey, n: u32) -> Result<(), CoreError> {
        self.min_ready.lock().push((spec_key, n));
        Ok(())
    }

    async fn push_catalog(&self, state: &Arc<CatalogState>) -> Result<(), CoreError> {
        self.catalogs.lock().push(state.revision);
        Ok(())
    }
}

/// Pid probe with an explicit dead set.
#[derive(Default)]
pub struct FakePidProbe {
    pub dead: Mutex<HashSet<u32>>,
}

impl PidProbe for FakePidProbe {
    fn alive(&self, pid: u32) -> bool {
        !self.dead.lock().contains(&pid)
    }
}
