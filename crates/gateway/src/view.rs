//! The mirrored view: what this gateway currently advertises to its IDE.
//!
//! Sync loops replace whole entity sets from received snapshots; the MCP
//! server reads them on demand. A diff of registered names decides whether a
//! list-changed notification goes out.

use corral::runtime::{PromptEntry, ResourceEntry, ToolEntry};
use parking_lot::Mutex;
use rmcp::service::{Peer, RoleServer};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Which names appeared or disappeared in one snapshot swap.
#[derive(Debug, Default, PartialEq)]
pub struct ViewDelta {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl ViewDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Tools,
    Resources,
    Prompts,
}

pub struct MirrorView {
    tools: Mutex<BTreeMap<String, ToolEntry>>,
    resources: Mutex<BTreeMap<String, ResourceEntry>>,
    prompts: Mutex<BTreeMap<String, PromptEntry>>,
    tools_ready: AtomicBool,
    tools_ready_notify: Notify,
    /// Peer of the active stdio session, for proactive notifications.
    peer: Mutex<Option<Peer<RoleServer>>>,
}

impl MirrorView {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            tools: Mutex::new(BTreeMap::new()),
            resources: Mutex::new(BTreeMap::new()),
            prompts: Mutex::new(BTreeMap::new()),
            tools_ready: AtomicBool::new(false),
            tools_ready_notify: Notify::new(),
            peer: Mutex::new(None),
        })
    }

    pub fn set_peer(&self, peer: Peer<RoleServer>) {
        *self.peer.lock() = Some(peer);
    }

    pub fn peer(&self) -> Option<Peer<RoleServer>> {
        self.peer.lock().clone()
    }

    // ── Snapshot application ────────────────────────────────────────────

    pub fn apply_tools(&self, items: Vec<ToolEntry>) -> ViewDelta {
        let delta = Self::apply(&self.tools, items, |t| t.name.clone());
        if !self.tools_ready.swap(true, Ordering::SeqCst) {
            self.tools_ready_notify.notify_waiters();
        }
        delta
    }

    pub fn apply_resources(&self, items: Vec<ResourceEntry>) -> ViewDelta {
        Self::apply(&self.resources, items, |r| r.uri.clone())
    }

    pub fn apply_prompts(&self, items: Vec<PromptEntry>) -> ViewDelta {
        Self::apply(&self.prompts, items, |p| p.name.clone())
    }

    fn apply<T>(
        slot: &Mutex<BTreeMap<String, T>>,
        items: Vec<T>,
        key: impl Fn(&T) -> String,
    ) -> ViewDelta {
        let next: BTreeMap<String, T> = items.into_iter().map(|item| (key(&item), item)).collect();
        let mut current = slot.lock();
        let added = next
            .keys()
            .filter(|name| !current.contains_key(*name))
            .cloned()
            .collect();
        let removed = current
            .keys()
            .filter(|name| !next.contains_key(*name))
            .cloned()
            .collect();
        *current = next;
        ViewDelta { added, removed }
    }

    // ── Reads ───────────────────────────────────────────────────────────

    pub fn tools(&self) -> Vec<ToolEntry> {
        self.tools.lock().values().cloned().collect()
    }

    pub fn resources(&self) -> Vec<ResourceEntry> {
        self.resources.lock().values().cloned().collect()
    }

    pub fn prompts(&self) -> Vec<PromptEntry> {
        self.prompts.lock().values().cloned().collect()
    }

    /// Block until the first tools snapshot landed, up to `timeout`. Returns
    /// false on timeout; the caller serves whatever is present.
    pub async fn wait_tools_ready(&self, timeout: Duration) -> bool {
        if self.tools_ready.load(Ordering::SeqCst) {
            return true;
        }
        tokio::time::timeout(timeout, async {
            loop {
                let notified = self.tools_ready_notify.notified();
                if self.tools_ready.load(Ordering::SeqCst) {
                    return;
                }
                notified.await;
            }
        })
        .await
        .is_ok()
    }

    /// Push a list-changed notification for `kind` to the connected IDE, if
    /// a session is up.
    pub async fn notify_list_changed(&self, kind: EntityKind) {
        let Some(peer) = self.peer() else {
            debug!(?kind, "no active session, skipping list-changed notification");
            return;
        };
        let result = match kind {
            EntityKind::Tools => peer.notify_tool_list_changed().await,
            EntityKind::Resources => peer.notify_resource_list_changed().await,
            EntityKind::Prompts => peer.notify_prompt_list_changed().await,
        };
        if let Err(err) = result {
            warn!(?kind, error = %err, "list-changed notification failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tool(name: &str) -> ToolEntry {
        ToolEntry {
            spec_key: corral::hash::ContentHash::of_bytes(b"spec"),
            server_name: "git".into(),
            name: name.into(),
            description: None,
            input_schema: json!({"type": "object"}),
            output_schema: None,
        }
    }

    #[test]
    fn apply_reports_added_and_removed_names() {
        let view = MirrorView::new();
        let delta = view.apply_tools(vec![tool("a"), tool("b")]);
        assert_eq!(delta.added, vec!["a".to_string(), "b".to_string()]);
        assert!(delta.removed.is_empty());

        let delta = view.apply_tools(vec![tool("b"), tool("c")]);
        assert_eq!(delta.added, vec!["c".to_string()]);
        assert_eq!(delta.removed, vec!["a".to_string()]);
        assert_eq!(view.tools().len(), 2);
    }

    #[test]
    fn identical_snapshot_is_an_empty_delta() {
        let view = MirrorView::new();
        view.apply_tools(vec![tool("a")]);
        let delta = view.apply_tools(vec![tool("a")]);
        assert!(delta.is_empty());
    }

    #[tokio::test]
    async fn tools_ready_gate_opens_on_first_snapshot() {
        let view = MirrorView::new();
        assert!(!view.wait_tools_ready(Duration::from_millis(20)).await);

        let waiter = Arc::clone(&view);
        let handle =
            tokio::spawn(async move { waiter.wait_tools_ready(Duration::from_secs(2)).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        view.apply_tools(vec![tool("a")]);
        assert!(handle.await.unwrap());

        // Already ready: returns immediately.
        assert!(view.wait_tools_ready(Duration::from_millis(1)).await);
    }
}
