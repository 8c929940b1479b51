//! File-backed catalog provider: a TOML catalog document, re-read on demand
//! and on mtime changes.

use async_trait::async_trait;
use corral::catalog::provider::CatalogProvider;
use corral::catalog::{Catalog, CatalogState};
use corral::error::CoreError;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct FileCatalogProvider {
    path: PathBuf,
    state: Mutex<Arc<CatalogState>>,
    revision: AtomicU64,
    senders: Mutex<Vec<mpsc::Sender<Arc<CatalogState>>>>,
    last_modified: Mutex<Option<SystemTime>>,
}

impl FileCatalogProvider {
    /// Parse the catalog file and produce revision 1.
    pub async fn load(path: impl Into<PathBuf>) -> Result<Arc<Self>, CoreError> {
        let path = path.into();
        let provider = Arc::new(Self {
            path,
            state: Mutex::new(Arc::new(CatalogState::empty())),
            revision: AtomicU64::new(0),
            senders: Mutex::new(Vec::new()),
            last_modified: Mutex::new(None),
        });
        provider.reload_file().await?;
        Ok(provider)
    }

    /// Poll the file's mtime; re-read when it moves. Editors that replace the
    /// file atomically change the mtime too, so polling catches both.
    pub fn spawn_poll(self: &Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let provider = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
                let modified = tokio::fs::metadata(&provider.path)
                    .await
                    .ok()
                    .and_then(|meta| meta.modified().ok());
                let changed = {
                    let mut last = provider.last_modified.lock();
                    match (modified, *last) {
                        (Some(now), Some(seen)) if now != seen => {
                            *last = Some(now);
                            true
                        }
                        (Some(now), None) => {
                            *last = Some(now);
                            false
                        }
                        _ => false,
                    }
                };
                if changed {
                    debug!(path = %provider.path.display(), "catalog file changed");
                    if let Err(err) = provider.reload_file().await {
                        warn!(error = %err, "catalog re-read failed, keeping previous snapshot");
                    }
                }
            }
        });
    }

    async fn reload_file(&self) -> Result<u64, CoreError> {
        let text = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            CoreError::InvalidArgument(format!("reading {}: {e}", self.path.display()))
        })?;
        let catalog = Catalog::from_toml(&text)?;
        catalog.validate()?;

        let revision = self.revision.fetch_add(1, Ordering::SeqCst) + 1;
        let state = Arc::new(CatalogState::new(catalog, revision));
        *self.state.lock() = Arc::clone(&state);
        if let Ok(meta) = std::fs::metadata(&self.path) {
            *self.last_modified.lock() = meta.modified().ok();
        }
        info!(
            revision,
            servers = state.summary.server_spec_keys.len(),
            "catalog snapshot published"
        );

        let senders = self.senders.lock().clone();
        for sender in senders {
            let _ = sender.send(Arc::clone(&state)).await;
        }
        Ok(revision)
    }
}

#[async_trait]
impl CatalogProvider for FileCatalogProvider {
    fn current(&self) -> Arc<CatalogState> {
        Arc::clone(&self.state.lock())
    }

    fn watch(&self) -> mpsc::Receiver<Arc<CatalogState>> {
        let (tx, rx) = mpsc::channel(16);
        self.senders.lock().push(tx);
        rx
    }

    async fn force_reload(&self) -> Result<u64, CoreError> {
        self.reload_file().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Seek, Write};

    fn write_catalog(file: &mut tempfile::NamedTempFile, body: &str) {
        file.as_file_mut().set_len(0).unwrap();
        file.as_file_mut().rewind().unwrap();
        file.write_all(body.as_bytes()).unwrap();
        file.flush().unwrap();
    }

    #[tokio::test]
    async fn load_parses_and_numbers_the_first_revision() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write_catalog(
            &mut file,
            r#"
            [servers.git]
            command = { command = "uvx", args = ["mcp-server-git"] }
            tags = ["git"]
            "#,
        );
        let provider = FileCatalogProvider::load(file.path()).await.unwrap();
        let state = provider.current();
        assert_eq!(state.revision, 1);
        assert!(state.summary.server_spec_keys.contains_key("git"));
    }

    #[tokio::test]
    async fn force_reload_bumps_the_revision_and_notifies() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write_catalog(
            &mut file,
            r#"
            [servers.git]
            command = { command = "uvx" }
            "#,
        );
        let provider = FileCatalogProvider::load(file.path()).await.unwrap();
        let mut watch = provider.watch();

        write_catalog(
            &mut file,
            r#"
            [servers.git]
            command = { command = "uvx" }

            [servers.docs]
            http = { url = "http://localhost:9000/mcp" }
            "#,
        );
        let revision = provider.force_reload().await.unwrap();
        assert_eq!(revision, 2);
        let state = watch.recv().await.unwrap();
        assert_eq!(state.revision, 2);
        assert_eq!(state.summary.server_spec_keys.len(), 2);
    }

    #[tokio::test]
    async fn broken_edit_keeps_the_previous_snapshot() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write_catalog(
            &mut file,
            r#"
            [servers.git]
            command = { command = "uvx" }
            "#,
        );
        let provider = FileCatalogProvider::load(file.path()).await.unwrap();

        write_catalog(&mut file, "not [valid toml");
        assert!(provider.force_reload().await.is_err());
        assert_eq!(provider.current().revision, 1);
    }
}
