//! Structured error type for the control plane core.
//!
//! Every failure surfaced across a subsystem boundary is one of these kinds;
//! the RPC layer maps each kind onto its gRPC-shaped status code in
//! [`crate::rpc`].

use std::time::Duration;
use thiserror::Error;

/// Core error kinds, one variant per observable failure class.
#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum CoreError {
    /// A caller-scoped method found no registration (or it was reaped).
    #[error("client not registered: {0}")]
    ClientNotRegistered(String),

    #[error("tool not found: {0}")]
    ToolNotFound(String),

    #[error("resource not found: {0}")]
    ResourceNotFound(String),

    #[error("prompt not found: {0}")]
    PromptNotFound(String),

    /// Pagination cursor absent from the current snapshot.
    #[error("invalid cursor: {0}")]
    InvalidCursor(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    // --- Spec launch failures, surfaced from the launcher ---
    #[error("invalid command for server '{server}': {reason}")]
    InvalidCommand { server: String, reason: String },

    #[error("executable not found: {0}")]
    ExecutableNotFound(String),

    #[error("permission denied launching '{0}'")]
    PermissionDenied(String),

    /// JSON-RPC connection dropped mid-call.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    #[error("route timeout after {0:?}")]
    RouteTimeout(Duration),

    // --- Reload outcomes ---
    /// The diff contains a runtime field only a restart can safely change.
    #[error("reload requires restart: {0}")]
    ReloadRestartRequired(String),

    /// A transactional step failed; the system is at the pre-reload state.
    #[error("reload rejected: {0}")]
    ReloadRejected(String),

    /// Transport-level failure; the caller should reconnect.
    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("unimplemented: {0}")]
    Unimplemented(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Map an I/O error from spawning a server process to its launch kind.
    pub fn from_launch_io(server: &str, err: &std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => CoreError::ExecutableNotFound(server.to_string()),
            std::io::ErrorKind::PermissionDenied => CoreError::PermissionDenied(server.to_string()),
            _ => CoreError::InvalidCommand {
                server: server.to_string(),
                reason: err.to_string(),
            },
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::Internal(format!("serialization: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn launch_io_mapping() {
        let nf = std::io::Error::new(std::io::ErrorKind::NotFound, "no such file");
        assert!(matches!(
            CoreError::from_launch_io("git", &nf),
            CoreError::ExecutableNotFound(_)
        ));

        let pd = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        assert!(matches!(
            CoreError::from_launch_io("git", &pd),
            CoreError::PermissionDenied(_)
        ));

        let other = std::io::Error::other("weird");
        assert!(matches!(
            CoreError::from_launch_io("git", &other),
            CoreError::InvalidCommand { .. }
        ));
    }
}
