//! Snapshot synchronization: one loop per entity kind, a heartbeat, and the
//! log relay. Loops are independent; each has its own capped exponential
//! backoff, so a broken watch on one kind never stalls the others.

use crate::client::ClientManager;
use crate::view::{EntityKind, MirrorView};
use corral::logs::LogLevel;
use corral::rpc::client::RpcError;
use corral::runtime::{ETag, PromptEntry, ResourceEntry};
use rmcp::model::{LoggingLevel, LoggingMessageNotificationParam};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(2);
const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Capped exponential backoff.
pub struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            current: base,
        }
    }

    /// The delay to sleep now; doubles for next time, up to the cap.
    pub fn next(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }
}

pub struct SyncEngine {
    manager: Arc<ClientManager>,
    view: Arc<MirrorView>,
    min_log_level: LogLevel,
}

impl SyncEngine {
    pub fn new(
        manager: Arc<ClientManager>,
        view: Arc<MirrorView>,
        min_log_level: LogLevel,
    ) -> Arc<Self> {
        Arc::new(Self {
            manager,
            view,
            min_log_level,
        })
    }

    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) {
        let engine = Arc::clone(self);
        let c = cancel.clone();
        tokio::spawn(async move { engine.heartbeat_loop(c).await });

        let engine = Arc::clone(self);
        let c = cancel.clone();
        tokio::spawn(async move { engine.tools_loop(c).await });

        let engine = Arc::clone(self);
        let c = cancel.clone();
        tokio::spawn(async move { engine.resources_loop(c).await });

        let engine = Arc::clone(self);
        let c = cancel.clone();
        tokio::spawn(async move { engine.prompts_loop(c).await });

        let engine = Arc::clone(self);
        tokio::spawn(async move { engine.logs_loop(cancel).await });
    }

    /// Re-register every two seconds; this doubles as the heartbeat.
    async fn heartbeat_loop(&self, cancel: CancellationToken) {
        loop {
            if !sleep_or_cancel(&cancel, HEARTBEAT_INTERVAL).await {
                return;
            }
            if let Err(err) = self.manager.register().await {
                debug!(error = %err, "heartbeat register failed");
                if err.is_unavailable() {
                    self.manager.reset().await;
                }
            }
        }
    }

    async fn tools_loop(&self, cancel: CancellationToken) {
        let caller = self.manager.identity().caller.clone();
        let mut backoff = Backoff::new(BACKOFF_BASE, BACKOFF_MAX);
        let mut etag: Option<ETag> = None;
        while !cancel.is_cancelled() {
            // Seed with a full listing.
            let seeded = self
                .manager
                .with_reregister(|client| {
                    let caller = caller.clone();
                    async move { client.list_tools(&caller).await }
                })
                .await;
            match seeded {
                Ok(snapshot) => {
                    etag = Some(snapshot.etag);
                    let delta = self.view.apply_tools(snapshot.items);
                    if !delta.is_empty() {
                        self.view.notify_list_changed(EntityKind::Tools).await;
                    }
                    backoff.reset();
                }
                Err(err) => {
                    warn!(error = %err, "tools seed failed");
                    if !sleep_or_cancel(&cancel, backoff.next()).await {
                        return;
                    }
                    continue;
                }
            }

            // Follow the watch stream until it breaks.
            self.watch_tools(&cancel, &caller, &mut etag, &mut backoff).await;
            if !sleep_or_cancel(&cancel, backoff.next()).await {
                return;
            }
        }
    }

    async fn watch_tools(
        &self,
        cancel: &CancellationToken,
        caller: &str,
        etag: &mut Option<ETag>,
        backoff: &mut Backoff,
    ) {
        let client = match self.manager.get().await {
            Ok(client) => client,
            Err(err) => {
                warn!(error = %err, "dial for tools watch failed");
                return;
            }
        };
        let mut stream = match client.watch_tools(caller, *etag).await {
            Ok(stream) => stream,
            Err(err) => {
                warn!(error = %err, "tools watch failed to open");
                if err.is_unavailable() {
                    self.manager.reset().await;
                }
                return;
            }
        };
        info!("tools watch established");
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => return,
                event = stream.next() => event,
            };
            match event {
                Some(Ok(snapshot)) => {
                    *etag = Some(snapshot.etag);
                    let delta = self.view.apply_tools(snapshot.items);
                    if !delta.is_empty() {
                        self.view.notify_list_changed(EntityKind::Tools).await;
                    }
                    backoff.reset();
                }
                Some(Err(err)) => {
                    warn!(error = %err, "tools watch broke");
                    self.manager.reset().await;
                    return;
                }
                None => {
                    debug!("tools watch ended");
                    return;
                }
            }
        }
    }

    async fn resources_loop(&self, cancel: CancellationToken) {
        let caller = self.manager.identity().caller.clone();
        let mut backoff = Backoff::new(BACKOFF_BASE, BACKOFF_MAX);
        let mut etag: Option<ETag> = None;
        while !cancel.is_cancelled() {
            match self.seed_resources(&caller).await {
                Ok((seeded_etag, items)) => {
                    etag = Some(seeded_etag);
                    let delta = self.view.apply_resources(items);
                    if !delta.is_empty() {
                        self.view.notify_list_changed(EntityKind::Resources).await;
                    }
                    backoff.reset();
                }
                Err(err) => {
                    warn!(error = %err, "resources seed failed");
                    if !sleep_or_cancel(&cancel, backoff.next()).await {
                        return;
                    }
                    continue;
                }
            }

            let client = match self.manager.get().await {
                Ok(client) => client,
                Err(_) => continue,
            };
            match client.watch_resources(&caller, etag).await {
                Ok(mut stream) => loop {
                    let event = tokio::select! {
                        _ = cancel.cancelled() => return,
                        event = stream.next() => event,
                    };
                    match event {
                        Some(Ok(snapshot)) => {
                            etag = Some(snapshot.etag);
                            let delta = self.view.apply_resources(snapshot.items);
                            if !delta.is_empty() {
                                self.view.notify_list_changed(EntityKind::Resources).await;
                            }
                            backoff.reset();
                        }
                        Some(Err(err)) => {
                            warn!(error = %err, "resources watch broke");
                            self.manager.reset().await;
                            break;
                        }
                        None => break,
                    }
                },
                Err(err) => {
                    warn!(error = %err, "resources watch failed to open");
                    if err.is_unavailable() {
                        self.manager.reset().await;
                    }
                }
            }
            if !sleep_or_cancel(&cancel, backoff.next()).await {
                return;
            }
        }
    }

    async fn prompts_loop(&self, cancel: CancellationToken) {
        let caller = self.manager.identity().caller.clone();
        let mut backoff = Backoff::new(BACKOFF_BASE, BACKOFF_MAX);
        let mut etag: Option<ETag> = None;
        while !cancel.is_cancelled() {
            match self.seed_prompts(&caller).await {
                Ok((seeded_etag, items)) => {
                    etag = Some(seeded_etag);
                    let delta = self.view.apply_prompts(items);
                    if !delta.is_empty() {
                        self.view.notify_list_changed(EntityKind::Prompts).await;
                    }
                    backoff.reset();
                }
                Err(err) => {
                    warn!(error = %err, "prompts seed failed");
                    if !sleep_or_cancel(&cancel, backoff.next()).await {
                        return;
                    }
                    continue;
                }
            }

            let client = match self.manager.get().await {
                Ok(client) => client,
                Err(_) => continue,
            };
            match client.watch_prompts(&caller, etag).await {
                Ok(mut stream) => loop {
                    let event = tokio::select! {
                        _ = cancel.cancelled() => return,
                        event = stream.next() => event,
                    };
                    match event {
                        Some(Ok(snapshot)) => {
                            etag = Some(snapshot.etag);
                            let delta = self.view.apply_prompts(snapshot.items);
                            if !delta.is_empty() {
                                self.view.notify_list_changed(EntityKind::Prompts).await;
                            }
                            backoff.reset();
                        }
                        Some(Err(err)) => {
                            warn!(error = %err, "prompts watch broke");
                            self.manager.reset().await;
                            break;
                        }
                        None => break,
                    }
                },
                Err(err) => {
                    warn!(error = %err, "prompts watch failed to open");
                    if err.is_unavailable() {
                        self.manager.reset().await;
                    }
                }
            }
            if !sleep_or_cancel(&cancel, backoff.next()).await {
                return;
            }
        }
    }

    /// Page through the resource listing. A mid-pagination ETag change means
    /// the snapshot moved under us; the caller restarts the seed.
    async fn seed_resources(&self, caller: &str) -> Result<(ETag, Vec<ResourceEntry>), RpcError> {
        let mut items = Vec::new();
        let mut cursor: Option<String> = None;
        let mut etag: Option<ETag> = None;
        loop {
            let page = self
                .manager
                .with_reregister(|client| {
                    let caller = caller.to_string();
                    let cursor = cursor.clone();
                    async move { client.list_resources(&caller, cursor).await }
                })
                .await?;
            match etag {
                None => etag = Some(page.etag),
                Some(expected) if expected != page.etag => {
                    return Err(RpcError::Transport(
                        "snapshot changed during pagination".into(),
                    ));
                }
                Some(_) => {}
            }
            items.extend(page.items);
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        Ok((etag.expect("at least one page"), items))
    }

    async fn seed_prompts(&self, caller: &str) -> Result<(ETag, Vec<PromptEntry>), RpcError> {
        let mut items = Vec::new();
        let mut cursor: Option<String> = None;
        let mut etag: Option<ETag> = None;
        loop {
            let page = self
                .manager
                .with_reregister(|client| {
                    let caller = caller.to_string();
                    let cursor = cursor.clone();
                    async move { client.list_prompts(&caller, cursor).await }
                })
                .await?;
            match etag {
                None => etag = Some(page.etag),
                Some(expected) if expected != page.etag => {
                    return Err(RpcError::Transport(
                        "snapshot changed during pagination".into(),
                    ));
                }
                Some(_) => {}
            }
            items.extend(page.items);
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        Ok((etag.expect("at least one page"), items))
    }

    /// Relay control-plane logs as MCP logging notifications.
    async fn logs_loop(&self, cancel: CancellationToken) {
        let caller = self.manager.identity().caller.clone();
        let mut backoff = Backoff::new(BACKOFF_BASE, BACKOFF_MAX);
        while !cancel.is_cancelled() {
            let client = match self.manager.get().await {
                Ok(client) => client,
                Err(_) => {
                    if !sleep_or_cancel(&cancel, backoff.next()).await {
                        return;
                    }
                    continue;
                }
            };
            match client.stream_logs(&caller, self.min_log_level).await {
                Ok(mut stream) => loop {
                    let event = tokio::select! {
                        _ = cancel.cancelled() => return,
                        event = stream.next() => event,
                    };
                    match event {
                        Some(Ok(entry)) => {
                            backoff.reset();
                            if let Some(peer) = self.view.peer() {
                                let param = LoggingMessageNotificationParam {
                                    level: logging_level(entry.level),
                                    logger: Some(entry.target.clone()),
                                    data: serde_json::Value::String(entry.message),
                                };
                                if let Err(err) = peer.notify_logging_message(param).await {
                                    debug!(error = %err, "log relay notification failed");
                                }
                            }
                        }
                        Some(Err(err)) => {
                            debug!(error = %err, "log stream broke");
                            self.manager.reset().await;
                            break;
                        }
                        None => break,
                    }
                },
                Err(err) => {
                    debug!(error = %err, "log stream failed to open");
                }
            }
            if !sleep_or_cancel(&cancel, backoff.next()).await {
                return;
            }
        }
    }
}

fn logging_level(level: LogLevel) -> LoggingLevel {
    match level {
        LogLevel::Trace | LogLevel::Debug => LoggingLevel::Debug,
        LogLevel::Info => LoggingLevel::Info,
        LogLevel::Warn => LoggingLevel::Warning,
        LogLevel::Error => LoggingLevel::Error,
    }
}

/// Sleep unless cancelled first. Returns false when cancelled.
async fn sleep_or_cancel(cancel: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_to_the_cap_and_resets() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
        assert_eq!(backoff.next(), Duration::from_secs(1));
        assert_eq!(backoff.next(), Duration::from_secs(2));
        assert_eq!(backoff.next(), Duration::from_secs(4));
        for _ in 0..10 {
            backoff.next();
        }
        assert_eq!(backoff.next(), Duration::from_secs(30));
        backoff.reset();
        assert_eq!(backoff.next(), Duration::from_secs(1));
    }

    #[test]
    fn log_levels_map_onto_mcp_levels() {
        assert_eq!(logging_level(LogLevel::Warn), LoggingLevel::Warning);
        assert_eq!(logging_level(LogLevel::Trace), LoggingLevel::Debug);
        assert_eq!(logging_level(LogLevel::Error), LoggingLevel::Error);
    }
}
