//! Contract for the external catalog source.
//!
//! The provider owns parsing and revision assignment; the reload manager is
//! its only watcher and consumes snapshots strictly in revision order.

use super::CatalogState;
use crate::error::CoreError;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Produces immutable [`CatalogState`] snapshots with monotonic revisions.
#[async_trait]
pub trait CatalogProvider: Send + Sync {
    /// The most recently produced snapshot.
    fn current(&self) -> Arc<CatalogState>;

    /// Sequential stream of snapshots. Intended for a single consumer (the
    /// reload manager); snapshots arrive in revision order.
    fn watch(&self) -> mpsc::Receiver<Arc<CatalogState>>;

    /// Re-read the source and publish a snapshot even if nothing changed.
    /// Returns the revision of the published snapshot.
    async fn force_reload(&self) -> Result<u64, CoreError>;
}
