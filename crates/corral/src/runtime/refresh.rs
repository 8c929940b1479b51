//! Entity refresh: pulls fresh listings from live servers with bounded
//! concurrency, driven by debounce ticks and scheduler events.

use super::items::{PromptEntry, ResourceEntry, ToolEntry};
use super::RuntimeState;
use crate::catalog::SpecKey;
use crate::error::CoreError;
use crate::scheduler::{ListChangedKind, ServerEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

impl RuntimeState {
    /// Spawn the refresh loops: a debounce ticker and a scheduler-event
    /// consumer. Both stop on cancellation.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) {
        let state = Arc::clone(self);
        let tick_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                let interval = state.refresh_interval();
                let sleep = if interval.is_zero() {
                    // Timed refresh disabled; poll the config once a second.
                    Duration::from_secs(1)
                } else {
                    interval
                };
                tokio::select! {
                    _ = tick_cancel.cancelled() => return,
                    _ = tokio::time::sleep(sleep) => {
                        if !interval.is_zero() {
                            state.refresh_all().await;
                        }
                    }
                }
            }
        });

        let state = Arc::clone(self);
        let mut events = self.scheduler().events();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => return,
                    event = events.recv() => event,
                };
                match event {
                    Ok(event) => state.handle_server_event(event).await,
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "scheduler event stream lagged, refreshing everything");
                        state.refresh_all().await;
                    }
                    Err(RecvError::Closed) => return,
                }
            }
        });
    }

    async fn handle_server_event(self: &Arc<Self>, event: ServerEvent) {
        match event {
            ServerEvent::InstanceReady { spec_key } => {
                if let Err(err) = self.refresh_spec(spec_key).await {
                    debug!(spec_key = %spec_key, error = %err, "initial listing failed");
                }
            }
            ServerEvent::ListChanged { spec_key, kind } => {
                if let Err(err) = self.refresh_kind(spec_key, kind).await {
                    debug!(spec_key = %spec_key, error = %err, "list_changed refresh failed");
                }
            }
            ServerEvent::SpecDown { spec_key } => {
                self.tools.mark_spec_down(spec_key);
                self.resources.mark_spec_down(spec_key);
                self.prompts.mark_spec_down(spec_key);
            }
        }
    }

    /// Refresh every spec that currently has ready instances. Failures keep
    /// the cached snapshot and are retried on the next trigger.
    pub async fn refresh_all(self: &Arc<Self>) {
        let pools = self.scheduler().pool_status().await;
        let mut tasks = Vec::new();
        for pool in pools {
            if pool.ready == 0 {
                continue;
            }
            let state = Arc::clone(self);
            tasks.push(tokio::spawn(async move {
                if let Err(err) = state.refresh_spec(pool.spec_key).await {
                    debug!(spec_key = %pool.spec_key, error = %err, "refresh failed");
                }
            }));
        }
        for task in tasks {
            task.await.ok();
        }
    }

    /// Refresh all three listings for one spec.
    pub async fn refresh_spec(&self, spec_key: SpecKey) -> Result<(), CoreError> {
        // Collapse concurrent triggers for the same spec.
        if !self.in_flight_refreshes.lock().insert(spec_key) {
            return Ok(());
        }
        let result = self.refresh_spec_inner(spec_key).await;
        self.in_flight_refreshes.lock().remove(&spec_key);
        result
    }

    async fn refresh_spec_inner(&self, spec_key: SpecKey) -> Result<(), CoreError> {
        let limiter = self.limiter();
        let _permit = limiter
            .acquire()
            .await
            .map_err(|_| CoreError::Unavailable("refresh limiter closed".into()))?;

        let instance = self.scheduler().acquire(spec_key, "").await?;
        let server_name = self
            .server_name_for(&spec_key)
            .unwrap_or_else(|| instance.server_name.clone());
        let channel = Arc::clone(&instance.channel);

        let result = async {
            let tools = channel.list_tools().await?;
            self.tools
                .set_spec_items(spec_key, convert_tools(spec_key, &server_name, &tools));

            let resources = channel.list_resources().await?;
            self.resources.set_spec_items(
                spec_key,
                resources
                    .iter()
                    .map(|r| ResourceEntry::from_resource(spec_key, &server_name, r))
                    .collect(),
            );

            let prompts = channel.list_prompts().await?;
            self.prompts.set_spec_items(
                spec_key,
                prompts
                    .iter()
                    .map(|p| PromptEntry::from_prompt(spec_key, &server_name, p))
                    .collect(),
            );
            Ok(())
        }
        .await;

        if let Err(err) = self.scheduler().release(instance).await {
            warn!(spec_key = %spec_key, error = %err, "release after refresh failed");
        }
        result
    }

    /// Refresh one listing kind for one spec, triggered by a
    /// `notifications/{kind}/list_changed`.
    pub async fn refresh_kind(
        &self,
        spec_key: SpecKey,
        kind: ListChangedKind,
    ) -> Result<(), CoreError> {
        let limiter = self.limiter();
        let _permit = limiter
            .acquire()
            .await
            .map_err(|_| CoreError::Unavailable("refresh limiter closed".into()))?;

        let instance = self.scheduler().acquire(spec_key, "").await?;
        let server_name = self
            .server_name_for(&spec_key)
            .unwrap_or_else(|| instance.server_name.clone());
        let channel = Arc::clone(&instance.channel);

        let result = match kind {
            ListChangedKind::Tools => channel.list_tools().await.map(|tools| {
                self.tools
                    .set_spec_items(spec_key, convert_tools(spec_key, &server_name, &tools));
            }),
            ListChangedKind::Resources => channel.list_resources().await.map(|resources| {
                self.resources.set_spec_items(
                    spec_key,
                    resources
                        .iter()
                        .map(|r| ResourceEntry::from_resource(spec_key, &server_name, r))
                        .collect(),
                );
            }),
            ListChangedKind::Prompts => channel.list_prompts().await.map(|prompts| {
                self.prompts.set_spec_items(
                    spec_key,
                    prompts
                        .iter()
                        .map(|p| PromptEntry::from_prompt(spec_key, &server_name, p))
                        .collect(),
                );
            }),
        };

        if let Err(err) = self.scheduler().release(instance).await {
            warn!(spec_key = %spec_key, error = %err, "release after refresh failed");
        }
        result
    }
}

/// Convert an rmcp tool list, skipping tools whose schemas are not
/// object-typed.
fn convert_tools(
    spec_key: SpecKey,
    server_name: &str,
    tools: &[rmcp::model::Tool],
) -> Vec<ToolEntry> {
    tools
        .iter()
        .filter_map(|tool| {
            let entry = ToolEntry::from_tool(spec_key, server_name, tool);
            if !ToolEntry::schema_is_object(&entry.input_schema) {
                warn!(
                    server = server_name,
                    tool = %entry.name,
                    "skipping tool with non-object input schema"
                );
                return None;
            }
            if let Some(output) = &entry.output_schema {
                if !ToolEntry::schema_is_object(output) {
                    warn!(
                        server = server_name,
                        tool = %entry.name,
                        "skipping tool with non-object output schema"
                    );
                    return None;
                }
            }
            Some(entry)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{catalog_state, spec, tool, FakeChannel, RecordingScheduler};
    use rmcp::model::{JsonObject, Tool};
    use std::sync::Arc;

    #[tokio::test]
    async fn refresh_spec_populates_all_three_caches() {
        let state = catalog_state(1, vec![spec("git", &["git"])]);
        let key = state.summary.server_spec_keys["git"];
        let scheduler = RecordingScheduler::new();
        let channel = Arc::new(FakeChannel {
            tools: vec![tool("git_status"), tool("git_log")],
            resources: vec![crate::test_utils::resource("file:///repo", "repo")],
            prompts: vec![crate::test_utils::prompt("commit_message")],
            ..Default::default()
        });
        scheduler.register_channel(key, "git", channel);
        let runtime = RuntimeState::new(state, scheduler);

        runtime.refresh_spec(key).await.unwrap();
        assert_eq!(runtime.tools.snapshot().items.len(), 2);
        assert_eq!(runtime.resources.snapshot().items.len(), 1);
        assert_eq!(runtime.prompts.snapshot().items.len(), 1);
        assert_eq!(
            runtime.tools.resolve("git_status").unwrap().1,
            "git".to_string()
        );
    }

    #[tokio::test]
    async fn failed_refresh_keeps_the_previous_listing() {
        let state = catalog_state(1, vec![spec("git", &["git"])]);
        let key = state.summary.server_spec_keys["git"];
        let scheduler = RecordingScheduler::new();
        scheduler.register_channel(
            key,
            "git",
            Arc::new(FakeChannel::with_tools(vec![tool("git_status")])),
        );
        let runtime = RuntimeState::new(state, Arc::clone(&scheduler));
        runtime.refresh_spec(key).await.unwrap();
        assert_eq!(runtime.tools.snapshot().items.len(), 1);

        scheduler.register_channel(
            key,
            "git",
            Arc::new(FakeChannel {
                fail_with: Some(CoreError::ConnectionClosed("boom".into())),
                ..Default::default()
            }),
        );
        assert!(runtime.refresh_spec(key).await.is_err());
        assert_eq!(runtime.tools.snapshot().items.len(), 1, "stale kept");
    }

    #[tokio::test]
    async fn non_object_schemas_are_skipped() {
        let mut bad = JsonObject::new();
        bad.insert("type".into(), serde_json::Value::String("string".into()));
        let tools = vec![
            tool("good"),
            Tool::new("bad".to_string(), "bad".to_string(), Arc::new(bad)),
        ];
        let key = crate::hash::ContentHash::of_bytes(b"k");
        let entries = convert_tools(key, "git", &tools);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "good");
    }

    #[tokio::test]
    async fn spec_down_clears_live_but_not_cache() {
        let state = catalog_state(1, vec![spec("git", &["git"])]);
        let key = state.summary.server_spec_keys["git"];
        let scheduler = RecordingScheduler::new();
        scheduler.register_channel(
            key,
            "git",
            Arc::new(FakeChannel::with_tools(vec![tool("git_status")])),
        );
        let runtime = RuntimeState::new(state, Arc::clone(&scheduler));
        runtime.refresh_spec(key).await.unwrap();

        runtime
            .handle_server_event(ServerEvent::SpecDown { spec_key: key })
            .await;
        assert!(runtime.tools.snapshot().is_empty());
        assert_eq!(runtime.tools.cached_snapshot().items.len(), 1);
    }
}
