//! Bootstrap orchestrator contract.
//!
//! In bootstrap mode, 0→1 activations route through an orchestrator that can
//! stage warm-up (e.g. sequenced cold starts) instead of hitting the
//! scheduler directly. The reload engine also pushes each applied catalog
//! snapshot here so the orchestrator plans against current state.

use crate::catalog::{CatalogState, SpecKey};
use crate::error::CoreError;
use async_trait::async_trait;
use std::sync::Arc;

#[async_trait]
pub trait Bootstrap: Send + Sync {
    async fn set_desired_min_ready(&self, spec_key: SpecKey, n: u32) -> Result<(), CoreError>;

    async fn push_catalog(&self, state: &Arc<CatalogState>) -> Result<(), CoreError>;
}
