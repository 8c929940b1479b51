//! Per-client discovery: filtered snapshots, cursor pagination, watch
//! streams, and cross-entity call routing.
//!
//! Filtering is a pure function of the client's resolved spec keys (or its
//! server pin), so identical filtered contents produce identical ETags for
//! every client that sees them.

use crate::catalog::SpecKey;
use crate::error::CoreError;
use crate::registry::ClientRegistry;
use crate::runtime::{
    ETag, EntityCache, EntityItem, PromptEntry, ResourceEntry, RuntimeState, Snapshot, ToolEntry,
};
use crate::scheduler::RouteContext;
use rmcp::model::{CallToolResult, GetPromptResult, JsonObject, ReadResourceResult};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// Page size for resource/prompt listings.
pub const PAGE_LIMIT: usize = 200;

/// A client's filtered view of one entity kind.
#[derive(Debug, Clone)]
pub struct FilteredSnapshot<T> {
    pub items: Arc<Vec<T>>,
    pub etag: ETag,
}

impl<T: EntityItem> FilteredSnapshot<T> {
    fn empty() -> Self {
        let snapshot = Snapshot::<T>::empty();
        Self {
            items: snapshot.items,
            etag: snapshot.etag,
        }
    }

    fn from_snapshot(snapshot: &Snapshot<T>) -> Self {
        Self {
            items: Arc::clone(&snapshot.items),
            etag: snapshot.etag,
        }
    }
}

/// One page of a filtered listing. `etag` is the ETag of the *full* filtered
/// list; a change between pages means the caller must restart.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_cursor: Option<String>,
    pub etag: ETag,
}

pub struct DiscoveryService {
    registry: Arc<ClientRegistry>,
    runtime: Arc<RuntimeState>,
}

impl DiscoveryService {
    pub fn new(registry: Arc<ClientRegistry>, runtime: Arc<RuntimeState>) -> Arc<Self> {
        Arc::new(Self { registry, runtime })
    }

    pub fn runtime(&self) -> &Arc<RuntimeState> {
        &self.runtime
    }

    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    // ── Filtered listings ───────────────────────────────────────────────

    pub fn list_tools(&self, client: &str) -> Result<FilteredSnapshot<ToolEntry>, CoreError> {
        self.filter_for_client(client, &self.runtime.tools)
    }

    pub fn list_resources(
        &self,
        client: &str,
        cursor: Option<&str>,
    ) -> Result<Page<ResourceEntry>, CoreError> {
        let filtered = self.filter_for_client(client, &self.runtime.resources)?;
        paginate(&filtered, cursor)
    }

    pub fn list_prompts(
        &self,
        client: &str,
        cursor: Option<&str>,
    ) -> Result<Page<PromptEntry>, CoreError> {
        let filtered = self.filter_for_client(client, &self.runtime.prompts)?;
        paginate(&filtered, cursor)
    }

    /// Unfiltered listings for the internal UI / sub-agent surface.
    pub fn list_tools_all(&self) -> FilteredSnapshot<ToolEntry> {
        FilteredSnapshot::from_snapshot(&self.runtime.tools.snapshot())
    }

    pub fn list_resources_all(&self) -> FilteredSnapshot<ResourceEntry> {
        FilteredSnapshot::from_snapshot(&self.runtime.resources.snapshot())
    }

    pub fn list_prompts_all(&self) -> FilteredSnapshot<PromptEntry> {
        FilteredSnapshot::from_snapshot(&self.runtime.prompts.snapshot())
    }

    fn filter_for_client<T: EntityItem>(
        &self,
        client: &str,
        cache: &EntityCache<T>,
    ) -> Result<FilteredSnapshot<T>, CoreError> {
        // A pinned client gets the server's pre-filtered slice unchanged.
        if let Some(server) = self.registry.resolve_client_server(client)? {
            return Ok(match cache.snapshot_for_server(&server) {
                Some(slice) => FilteredSnapshot {
                    items: slice.items,
                    etag: slice.etag,
                },
                None => FilteredSnapshot::empty(),
            });
        }

        let visible: BTreeSet<SpecKey> = self
            .registry
            .resolve_visible_spec_keys(client)?
            .into_iter()
            .collect();
        let catalog = self.runtime.current_catalog();
        let visible_servers: BTreeSet<&str> = catalog
            .summary
            .server_spec_keys
            .iter()
            .filter(|(_, key)| visible.contains(key))
            .map(|(name, _)| name.as_str())
            .collect();

        let snapshot = cache.snapshot();
        let filtered: Vec<T> = snapshot
            .items
            .iter()
            .filter(|item| {
                if !visible_servers.is_empty() {
                    visible_servers.contains(item.server_name())
                } else {
                    visible.contains(&item.spec_key())
                }
            })
            .cloned()
            .collect();

        // Canonical re-sort and a recomputed ETag: identical filtered
        // contents share an ETag across clients and processes.
        let rebuilt = Snapshot::build(filtered);
        Ok(FilteredSnapshot {
            items: rebuilt.items,
            etag: rebuilt.etag,
        })
    }

    // ── Watch ───────────────────────────────────────────────────────────

    /// Coalescing per-client watch: re-derives the filtered snapshot when the
    /// kind's snapshot or the client's visibility changes. The single-slot
    /// watch channel is latest-wins, so a slow consumer skips intermediate
    /// revisions but always ends up observing the current one. The stream
    /// ends when the client unregisters or the receiver is dropped.
    pub fn watch_tools(
        self: &Arc<Self>,
        client: &str,
    ) -> Result<watch::Receiver<FilteredSnapshot<ToolEntry>>, CoreError> {
        self.watch_kind(client, |service| &service.runtime.tools)
    }

    pub fn watch_resources(
        self: &Arc<Self>,
        client: &str,
    ) -> Result<watch::Receiver<FilteredSnapshot<ResourceEntry>>, CoreError> {
        self.watch_kind(client, |service| &service.runtime.resources)
    }

    pub fn watch_prompts(
        self: &Arc<Self>,
        client: &str,
    ) -> Result<watch::Receiver<FilteredSnapshot<PromptEntry>>, CoreError> {
        self.watch_kind(client, |service| &service.runtime.prompts)
    }

    fn watch_kind<T, F>(
        self: &Arc<Self>,
        client: &str,
        cache_of: F,
    ) -> Result<watch::Receiver<FilteredSnapshot<T>>, CoreError>
    where
        T: EntityItem,
        F: Fn(&DiscoveryService) -> &EntityCache<T> + Send + Sync + 'static,
    {
        let initial = self.filter_for_client(client, cache_of(self))?;
        let (tx, rx) = watch::channel(initial.clone());

        let service = Arc::clone(self);
        let client = client.to_string();
        let mut snapshots = cache_of(&service).subscribe();
        let mut changes = service.registry.watch_client_changes();
        tokio::spawn(async move {
            let mut last_etag = initial.etag;
            loop {
                tokio::select! {
                    edge = snapshots.recv() => {
                        if edge.is_none() {
                            return;
                        }
                    }
                    change = changes.recv() => {
                        match change {
                            Some(change) if change.client == client => {
                                if change.removed {
                                    return;
                                }
                            }
                            Some(_) => continue,
                            None => return,
                        }
                    }
                }
                let filtered = match service.filter_for_client(&client, cache_of(&service)) {
                    Ok(filtered) => filtered,
                    // Reaped between edges; the stream is over.
                    Err(_) => return,
                };
                if filtered.etag == last_etag {
                    continue;
                }
                last_etag = filtered.etag;
                // watch overwrites the slot, so the value is never dropped;
                // send only fails once the receiver is gone.
                if tx.send(filtered).is_err() {
                    return;
                }
            }
        });
        Ok(rx)
    }

    // ── Calls ───────────────────────────────────────────────────────────

    pub async fn call_tool(
        &self,
        client: &str,
        name: &str,
        arguments: Option<JsonObject>,
        routing_key: &str,
    ) -> Result<CallToolResult, CoreError> {
        let spec_key = self.resolve_visible(client, name, &self.runtime.tools, || {
            CoreError::ToolNotFound(name.to_string())
        })?;
        let route = RouteContext {
            client: client.to_string(),
            routing_key: routing_key.to_string(),
        };
        self.runtime
            .dispatch_tool_call(&route, spec_key, name, arguments)
            .await
    }

    pub async fn read_resource(
        &self,
        client: &str,
        uri: &str,
    ) -> Result<ReadResourceResult, CoreError> {
        let spec_key = self.resolve_visible(client, uri, &self.runtime.resources, || {
            CoreError::ResourceNotFound(uri.to_string())
        })?;
        let route = RouteContext {
            client: client.to_string(),
            routing_key: String::new(),
        };
        self.runtime.dispatch_resource_read(&route, spec_key, uri).await
    }

    pub async fn get_prompt(
        &self,
        client: &str,
        name: &str,
        arguments: Option<JsonObject>,
    ) -> Result<GetPromptResult, CoreError> {
        let spec_key = self.resolve_visible(client, name, &self.runtime.prompts, || {
            CoreError::PromptNotFound(name.to_string())
        })?;
        let route = RouteContext {
            client: client.to_string(),
            routing_key: String::new(),
        };
        self.runtime
            .dispatch_prompt_get(&route, spec_key, name, arguments)
            .await
    }

    /// Visibility-bypassing call for the internal UI / sub-agent.
    pub async fn call_tool_all(
        &self,
        client: &str,
        name: &str,
        arguments: Option<JsonObject>,
        routing_key: &str,
    ) -> Result<CallToolResult, CoreError> {
        let (spec_key, _) = self
            .runtime
            .tools
            .resolve(name)
            .ok_or_else(|| CoreError::ToolNotFound(name.to_string()))?;
        let route = RouteContext {
            client: client.to_string(),
            routing_key: routing_key.to_string(),
        };
        self.runtime
            .dispatch_tool_call(&route, spec_key, name, arguments)
            .await
    }

    pub async fn read_resource_all(
        &self,
        client: &str,
        uri: &str,
    ) -> Result<ReadResourceResult, CoreError> {
        let (spec_key, _) = self
            .runtime
            .resources
            .resolve(uri)
            .ok_or_else(|| CoreError::ResourceNotFound(uri.to_string()))?;
        let route = RouteContext {
            client: client.to_string(),
            routing_key: String::new(),
        };
        self.runtime.dispatch_resource_read(&route, spec_key, uri).await
    }

    pub async fn get_prompt_all(
        &self,
        client: &str,
        name: &str,
        arguments: Option<JsonObject>,
    ) -> Result<GetPromptResult, CoreError> {
        let (spec_key, _) = self
            .runtime
            .prompts
            .resolve(name)
            .ok_or_else(|| CoreError::PromptNotFound(name.to_string()))?;
        let route = RouteContext {
            client: client.to_string(),
            routing_key: String::new(),
        };
        self.runtime
            .dispatch_prompt_get(&route, spec_key, name, arguments)
            .await
    }

    /// Resolve an item for a client and enforce visibility: pinned clients
    /// resolve inside their server's slice, everyone else resolves globally
    /// and must hold the item's spec key.
    fn resolve_visible<T: EntityItem>(
        &self,
        client: &str,
        key: &str,
        cache: &EntityCache<T>,
        not_found: impl Fn() -> CoreError,
    ) -> Result<SpecKey, CoreError> {
        if let Some(server) = self.registry.resolve_client_server(client)? {
            return cache
                .resolve_for_server(&server, key)
                .map(|(spec_key, _)| spec_key)
                .ok_or_else(&not_found);
        }
        let (spec_key, _) = cache.resolve(key).ok_or_else(&not_found)?;
        let visible = self.registry.resolve_visible_spec_keys(client)?;
        if !visible.contains(&spec_key) {
            debug!(client, item = key, "visibility filter removed resolved item");
            return Err(not_found());
        }
        Ok(spec_key)
    }
}

/// Cursor pagination over a filtered listing. The cursor is the item key of
/// the last item on the previous page; an unknown cursor is an error.
fn paginate<T: EntityItem>(
    filtered: &FilteredSnapshot<T>,
    cursor: Option<&str>,
) -> Result<Page<T>, CoreError> {
    let items = &filtered.items;
    let start = match cursor {
        None => 0,
        Some("") => 0,
        Some(cursor) => {
            let position = items
                .iter()
                .position(|item| item.item_key() == cursor)
                .ok_or_else(|| CoreError::InvalidCursor(cursor.to_string()))?;
            position + 1
        }
    };
    let end = (start + PAGE_LIMIT).min(items.len());
    let page: Vec<T> = items[start..end].to_vec();
    let next_cursor = if end < items.len() {
        page.last().map(|item| item.item_key().to_string())
    } else {
        None
    };
    Ok(Page {
        items: page,
        next_cursor,
        etag: filtered.etag,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{catalog_state, spec, tool, FakeChannel, RecordingScheduler};
    use serde_json::json;

    struct Fixture {
        discovery: Arc<DiscoveryService>,
        registry: Arc<ClientRegistry>,
        runtime: Arc<RuntimeState>,
        git_key: SpecKey,
    }

    async fn fixture() -> Fixture {
        let state = catalog_state(
            1,
            vec![spec("git", &["git"]), spec("docker", &["docker"])],
        );
        let git_key = state.summary.server_spec_keys["git"];
        let docker_key = state.summary.server_spec_keys["docker"];
        let scheduler = RecordingScheduler::new();
        scheduler.register_channel(
            git_key,
            "git",
            Arc::new(FakeChannel::with_tools(vec![tool("git_status")])),
        );
        scheduler.register_channel(
            docker_key,
            "docker",
            Arc::new(FakeChannel::with_tools(vec![tool("docker_ps")])),
        );
        let registry = ClientRegistry::new(Arc::clone(&state), Arc::clone(&scheduler), None);
        let runtime = RuntimeState::new(state, scheduler);
        runtime.refresh_spec(git_key).await.unwrap();
        runtime.refresh_spec(docker_key).await.unwrap();
        let discovery = DiscoveryService::new(Arc::clone(&registry), Arc::clone(&runtime));
        Fixture {
            discovery,
            registry,
            runtime,
            git_key,
        }
    }

    fn tool_entry(spec_key: SpecKey, server: &str, name: &str) -> ToolEntry {
        ToolEntry {
            spec_key,
            server_name: server.into(),
            name: name.into(),
            description: None,
            input_schema: json!({"type": "object"}),
            output_schema: None,
        }
    }

    #[tokio::test]
    async fn tag_filter_hides_other_servers() {
        let f = fixture().await;
        f.registry
            .register("ide", 1, &["git".to_string()], None)
            .await
            .unwrap();

        let view = f.discovery.list_tools("ide").unwrap();
        assert_eq!(view.items.len(), 1);
        assert_eq!(view.items[0].name, "git_status");
    }

    #[tokio::test]
    async fn unregistered_client_is_rejected() {
        let f = fixture().await;
        assert!(matches!(
            f.discovery.list_tools("ghost"),
            Err(CoreError::ClientNotRegistered(_))
        ));
    }

    #[tokio::test]
    async fn identical_visibility_shares_the_etag() {
        let f = fixture().await;
        f.registry
            .register("a", 1, &["git".to_string()], None)
            .await
            .unwrap();
        f.registry
            .register("b", 2, &["git".to_string()], None)
            .await
            .unwrap();

        let va = f.discovery.list_tools("a").unwrap();
        let vb = f.discovery.list_tools("b").unwrap();
        assert_eq!(va.etag, vb.etag);
    }

    #[tokio::test]
    async fn pinned_client_gets_the_server_slice_unchanged() {
        let f = fixture().await;
        f.registry.register("pin", 1, &[], Some("docker")).await.unwrap();

        let view = f.discovery.list_tools("pin").unwrap();
        assert_eq!(view.items.len(), 1);
        assert_eq!(view.items[0].name, "docker_ps");
        let slice = f.runtime.tools.snapshot_for_server("docker").unwrap();
        assert_eq!(view.etag, slice.etag);
    }

    #[tokio::test]
    async fn invalid_cursor_is_rejected() {
        // S4: a cursor that is not in the snapshot fails loudly.
        let f = fixture().await;
        f.registry.register("ide", 1, &[], None).await.unwrap();
        f.runtime.resources.set_spec_items(
            f.git_key,
            vec![
                crate::runtime::ResourceEntry {
                    spec_key: f.git_key,
                    server_name: "git".into(),
                    uri: "file:///a".into(),
                    name: "a".into(),
                    description: None,
                    mime_type: None,
                },
                crate::runtime::ResourceEntry {
                    spec_key: f.git_key,
                    server_name: "git".into(),
                    uri: "file:///b".into(),
                    name: "b".into(),
                    description: None,
                    mime_type: None,
                },
            ],
        );

        let err = f
            .discovery
            .list_resources("ide", Some("missing"))
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidCursor(_)));
    }

    #[tokio::test]
    async fn pagination_round_trips_the_full_snapshot() {
        let f = fixture().await;
        f.registry.register("ide", 1, &[], None).await.unwrap();
        let many: Vec<ToolEntry> = (0..450)
            .map(|i| tool_entry(f.git_key, "git", &format!("tool_{i:04}")))
            .collect();
        f.runtime.prompts.set_spec_items(
            f.git_key,
            many.iter()
                .map(|t| crate::runtime::PromptEntry {
                    spec_key: t.spec_key,
                    server_name: t.server_name.clone(),
                    name: t.name.clone(),
                    description: None,
                    arguments: None,
                })
                .collect(),
        );

        let mut collected = Vec::new();
        let mut cursor: Option<String> = None;
        let mut etag = None;
        loop {
            let page = f
                .discovery
                .list_prompts("ide", cursor.as_deref())
                .unwrap();
            match etag {
                None => etag = Some(page.etag),
                Some(previous) => assert_eq!(previous, page.etag, "etag stable across pages"),
            }
            assert!(page.items.len() <= PAGE_LIMIT);
            collected.extend(page.items);
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        let full = f.discovery.list_prompts("ide", None).unwrap().etag;
        assert_eq!(etag.unwrap(), full);
        assert_eq!(collected.len(), 450);
        let names: Vec<&str> = collected.iter().map(|p| p.name.as_str()).collect();
        let mut sorted = names.clone();
        sorted.sort_unstable();
        assert_eq!(names, sorted, "pages concatenate in snapshot order");
    }

    #[tokio::test]
    async fn call_tool_enforces_visibility() {
        let f = fixture().await;
        f.registry
            .register("ide", 1, &["git".to_string()], None)
            .await
            .unwrap();

        assert!(f.discovery.call_tool("ide", "git_status", None, "").await.is_ok());
        let err = f
            .discovery
            .call_tool("ide", "docker_ps", None, "")
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::ToolNotFound(_)));

        // The bypassing variant sees everything.
        assert!(
            f.discovery
                .call_tool_all("internal:ui", "docker_ps", None, "")
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn pinned_call_resolves_inside_the_pin() {
        let f = fixture().await;
        f.registry.register("pin", 1, &[], Some("git")).await.unwrap();

        assert!(f.discovery.call_tool("pin", "git_status", None, "").await.is_ok());
        assert!(matches!(
            f.discovery.call_tool("pin", "docker_ps", None, "").await,
            Err(CoreError::ToolNotFound(_))
        ));
    }

    #[tokio::test]
    async fn watch_re_emits_on_snapshot_and_visibility_edges() {
        let f = fixture().await;
        f.registry
            .register("ide", 1, &["git".to_string()], None)
            .await
            .unwrap();
        let mut watch = f.discovery.watch_tools("ide").unwrap();
        let initial = watch.borrow_and_update().clone();
        assert_eq!(initial.items.len(), 1);

        // A new tool appears on the visible server.
        f.runtime.tools.set_spec_items(
            f.git_key,
            vec![
                tool_entry(f.git_key, "git", "git_status"),
                tool_entry(f.git_key, "git", "git_diff"),
            ],
        );
        watch.changed().await.unwrap();
        let next = watch.borrow_and_update().clone();
        assert_eq!(next.items.len(), 2);
        assert_ne!(next.etag, initial.etag);

        // Visibility change: the client now sees docker instead of git.
        f.registry
            .register("ide", 1, &["docker".to_string()], None)
            .await
            .unwrap();
        watch.changed().await.unwrap();
        let swapped = watch.borrow_and_update().clone();
        assert_eq!(swapped.items.len(), 1);
        assert_eq!(swapped.items[0].name, "docker_ps");
    }

    #[tokio::test]
    async fn slow_watcher_still_observes_the_latest_snapshot() {
        // The slot is latest-wins: two quick edges without an intervening
        // read leave the newest revision, never a stale one.
        let f = fixture().await;
        f.registry
            .register("ide", 1, &["git".to_string()], None)
            .await
            .unwrap();
        let mut watch = f.discovery.watch_tools("ide").unwrap();
        let _ = watch.borrow_and_update().clone();

        f.runtime.tools.set_spec_items(
            f.git_key,
            vec![
                tool_entry(f.git_key, "git", "git_status"),
                tool_entry(f.git_key, "git", "git_diff"),
            ],
        );
        watch.changed().await.unwrap();
        // Not read yet; a second edge lands on top of the unread value.
        f.runtime.tools.set_spec_items(
            f.git_key,
            vec![
                tool_entry(f.git_key, "git", "git_status"),
                tool_entry(f.git_key, "git", "git_diff"),
                tool_entry(f.git_key, "git", "git_log"),
            ],
        );
        watch.changed().await.unwrap();
        let latest = watch.borrow_and_update().clone();
        assert_eq!(latest.items.len(), 3);
        let expected = f.discovery.list_tools("ide").unwrap();
        assert_eq!(latest.etag, expected.etag);
    }

    #[tokio::test]
    async fn watch_ends_when_the_client_unregisters() {
        let f = fixture().await;
        f.registry
            .register("ide", 1, &["git".to_string()], None)
            .await
            .unwrap();
        let mut watch = f.discovery.watch_tools("ide").unwrap();
        let _ = watch.borrow_and_update().clone();

        f.registry.unregister("ide").await.unwrap();
        // The sender side drops once the removal event is processed.
        assert!(watch.changed().await.is_err());
    }
}
