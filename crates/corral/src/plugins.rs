//! Plugin host contract and the no-op default.
//!
//! Plugins are out-of-process extensions declared in the catalog; the reload
//! engine applies plugin diffs to the host first and then to the call
//! pipeline. The host implementation is external; the core only drives it.

use crate::catalog::PluginDiff;
use crate::error::CoreError;
use async_trait::async_trait;

#[async_trait]
pub trait PluginHost: Send + Sync {
    /// Apply a plugin delta to the host, then to the pipeline. Must be
    /// idempotent: applying the same diff twice is a no-op.
    async fn apply(&self, diff: &PluginDiff) -> Result<(), CoreError>;
}

/// Host used when no plugin runtime is wired in.
#[derive(Debug, Default)]
pub struct NoopPluginHost;

#[async_trait]
impl PluginHost for NoopPluginHost {
    async fn apply(&self, _diff: &PluginDiff) -> Result<(), CoreError> {
        Ok(())
    }
}
