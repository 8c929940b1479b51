//! Contract for the scheduler primitive that owns server instances.
//!
//! The control plane never launches processes itself; it requests pool
//! adjustments and borrows instances through this narrow interface. The
//! in-process implementation lives in the daemon crate; tests use the
//! recording fake from [`crate::test_utils`].

use crate::catalog::{CatalogDiff, ServerSpec, SpecKey};
use crate::error::CoreError;
use async_trait::async_trait;
use rmcp::model::{
    CallToolRequestParam, CallToolResult, GetPromptRequestParam, GetPromptResult, JsonObject,
    Prompt, RawResource, ReadResourceRequestParam, ReadResourceResult, Tool,
};
use rmcp::service::ServerSink;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

/// Why an instance is being acquired. Attached to the routing span so
/// telemetry and scheduler policy can tell a user click from pool warm-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CauseReason {
    ToolCall,
    ResourceRead,
    PromptGet,
    Refresh,
    WarmUp,
}

/// Provenance of one invocation.
#[derive(Debug, Clone, Serialize)]
pub struct StartCause {
    pub reason: CauseReason,
    pub client: Option<String>,
    pub tool: Option<String>,
}

impl StartCause {
    pub fn tool_call(client: &str, tool: &str) -> Self {
        Self {
            reason: CauseReason::ToolCall,
            client: Some(client.to_string()),
            tool: Some(tool.to_string()),
        }
    }

    pub fn refresh() -> Self {
        Self {
            reason: CauseReason::Refresh,
            client: None,
            tool: None,
        }
    }
}

/// Per-call routing context threaded through dispatch.
#[derive(Debug, Clone, Serialize)]
pub struct RouteContext {
    pub client: String,
    pub routing_key: String,
}

/// The JSON-RPC surface of one live server connection.
///
/// Abstracting the wire keeps the codec external to the core and lets tests
/// drive the call path without a process.
#[async_trait]
pub trait InstanceChannel: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<Tool>, CoreError>;
    async fn list_resources(&self) -> Result<Vec<RawResource>, CoreError>;
    async fn list_prompts(&self) -> Result<Vec<Prompt>, CoreError>;
    async fn call_tool(
        &self,
        name: &str,
        arguments: Option<JsonObject>,
    ) -> Result<CallToolResult, CoreError>;
    async fn read_resource(&self, uri: &str) -> Result<ReadResourceResult, CoreError>;
    async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<JsonObject>,
    ) -> Result<GetPromptResult, CoreError>;
}

/// [`InstanceChannel`] over a live rmcp client peer.
pub struct SinkChannel(pub ServerSink);

fn wire_err(e: impl std::fmt::Display) -> CoreError {
    CoreError::ConnectionClosed(e.to_string())
}

#[async_trait]
impl InstanceChannel for SinkChannel {
    async fn list_tools(&self) -> Result<Vec<Tool>, CoreError> {
        self.0.list_all_tools().await.map_err(wire_err)
    }

    async fn list_resources(&self) -> Result<Vec<RawResource>, CoreError> {
        let resources = self.0.list_all_resources().await.map_err(wire_err)?;
        Ok(resources.into_iter().map(|r| r.raw).collect())
    }

    async fn list_prompts(&self) -> Result<Vec<Prompt>, CoreError> {
        self.0.list_all_prompts().await.map_err(wire_err)
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: Option<JsonObject>,
    ) -> Result<CallToolResult, CoreError> {
        let mut params = CallToolRequestParam::new(name.to_string());
        if let Some(arguments) = arguments {
            params = params.with_arguments(arguments);
        }
        self.0.call_tool(params).await.map_err(wire_err)
    }

    async fn read_resource(&self, uri: &str) -> Result<ReadResourceResult, CoreError> {
        self.0
            .read_resource(ReadResourceRequestParam::new(uri.to_string()))
            .await
            .map_err(wire_err)
    }

    async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<JsonObject>,
    ) -> Result<GetPromptResult, CoreError> {
        let mut params = GetPromptRequestParam::new(name.to_string());
        if let Some(arguments) = arguments {
            params = params.with_arguments(arguments);
        }
        self.0.get_prompt(params).await.map_err(wire_err)
    }
}

/// One borrowed server instance.
pub struct Instance {
    pub id: uuid::Uuid,
    pub spec_key: SpecKey,
    pub server_name: String,
    pub channel: Arc<dyn InstanceChannel>,
    pub started_at: Instant,
    calls: AtomicU64,
}

impl Instance {
    pub fn new(spec_key: SpecKey, server_name: &str, channel: Arc<dyn InstanceChannel>) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            spec_key,
            server_name: server_name.to_string(),
            channel,
            started_at: Instant::now(),
            calls: AtomicU64::new(0),
        }
    }

    /// Bump the usage counter; called once per completed round trip.
    pub fn record_call(&self) {
        self.calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("id", &self.id)
            .field("spec_key", &self.spec_key)
            .field("server_name", &self.server_name)
            .field("calls", &self.call_count())
            .finish()
    }
}

/// Events the scheduler pushes back into the control plane.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// An instance finished its handshake and can serve traffic. Triggers the
    /// initial entity listing for its spec.
    InstanceReady { spec_key: SpecKey },
    /// The server sent `notifications/{kind}/list_changed`.
    ListChanged {
        spec_key: SpecKey,
        kind: ListChangedKind,
    },
    /// All instances of a spec are gone (stopped or dead).
    SpecDown { spec_key: SpecKey },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListChangedKind {
    Tools,
    Resources,
    Prompts,
}

/// Operator-facing pool snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct PoolInfo {
    pub spec_key: SpecKey,
    pub server_name: String,
    pub ready: usize,
    pub in_use: usize,
    pub desired_min_ready: u32,
}

/// The narrow scheduler interface consumed by the control plane.
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Borrow an instance, launching one if the pool allows it.
    async fn acquire(&self, spec_key: SpecKey, routing_key: &str)
    -> Result<Arc<Instance>, CoreError>;

    /// Borrow an instance, waiting until one is ready. Callers bound the wait
    /// with their route timeout.
    async fn acquire_ready(
        &self,
        spec_key: SpecKey,
        routing_key: &str,
    ) -> Result<Arc<Instance>, CoreError>;

    async fn release(&self, instance: Arc<Instance>) -> Result<(), CoreError>;

    /// Atomically apply a catalog diff: stop removed fingerprints, prepare
    /// added/replaced ones, retune updated pools.
    async fn apply_catalog_diff(
        &self,
        diff: &CatalogDiff,
        registry: &BTreeMap<SpecKey, Arc<ServerSpec>>,
    ) -> Result<(), CoreError>;

    async fn set_desired_min_ready(&self, spec_key: SpecKey, n: u32) -> Result<(), CoreError>;

    async fn stop_spec(&self, spec_key: SpecKey, reason: &str) -> Result<(), CoreError>;

    fn start_idle_manager(&self, interval: Duration);
    fn stop_idle_manager(&self);
    fn start_ping_manager(&self, interval: Duration);
    fn stop_ping_manager(&self);

    async fn stop_all(&self);

    async fn pool_status(&self) -> Vec<PoolInfo>;

    /// Subscribe to scheduler-side events (instance readiness, list_changed
    /// notifications, spec death).
    fn events(&self) -> broadcast::Receiver<ServerEvent>;
}
