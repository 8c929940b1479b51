//! The control-plane aggregate: everything the RPC surface serves.

use crate::discovery::DiscoveryService;
use crate::error::CoreError;
use crate::logs::LogBroadcaster;
use crate::registry::ClientRegistry;
use crate::reload::ReloadManager;
use crate::runtime::RuntimeState;
use crate::scheduler::Scheduler;
use std::sync::Arc;

pub struct ControlPlane {
    pub registry: Arc<ClientRegistry>,
    pub discovery: Arc<DiscoveryService>,
    pub runtime: Arc<RuntimeState>,
    pub reload: Arc<ReloadManager>,
    pub logs: Arc<LogBroadcaster>,
    pub scheduler: Arc<dyn Scheduler>,
    /// Bearer token required on the RPC boundary when set.
    pub auth_token: Option<String>,
}

impl ControlPlane {
    pub fn ensure_registered(&self, caller: &str) -> Result<(), CoreError> {
        if self.registry.contains(caller) {
            Ok(())
        } else {
            Err(CoreError::ClientNotRegistered(caller.to_string()))
        }
    }

    pub fn sub_agent_enabled(&self) -> bool {
        self.reload.current().summary.runtime.sub_agent_enabled
    }
}
