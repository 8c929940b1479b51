//! gRPC-shaped control surface carried over HTTP/JSON + SSE.
//!
//! The status-code contract is the interface: callers react to codes, never
//! to messages. `FailedPrecondition` means "re-register and retry",
//! `Unavailable` means "reconnect", everything else is terminal for the
//! attempt.

pub mod client;
pub mod server;

use crate::discovery::{FilteredSnapshot, Page};
use crate::error::CoreError;
use crate::logs::LogLevel;
use crate::runtime::{ETag, EntityItem};
use rmcp::model::JsonObject;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Code {
    /// Caller not registered; retry after `register`.
    FailedPrecondition,
    /// Transport dropped; the client should reconnect.
    Unavailable,
    NotFound,
    InvalidArgument,
    DeadlineExceeded,
    Unimplemented,
    Internal,
}

/// The error envelope every non-2xx response carries.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{code:?}: {message}")]
pub struct Status {
    pub code: Code,
    pub message: String,
}

impl Status {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn http_status(&self) -> u16 {
        match self.code {
            Code::FailedPrecondition => 412,
            Code::Unavailable => 503,
            Code::NotFound => 404,
            Code::InvalidArgument => 400,
            Code::DeadlineExceeded => 504,
            Code::Unimplemented => 501,
            Code::Internal => 500,
        }
    }
}

impl From<CoreError> for Status {
    fn from(err: CoreError) -> Self {
        let code = match &err {
            CoreError::ClientNotRegistered(_) => Code::FailedPrecondition,
            CoreError::ToolNotFound(_)
            | CoreError::ResourceNotFound(_)
            | CoreError::PromptNotFound(_) => Code::NotFound,
            CoreError::InvalidCursor(_) | CoreError::InvalidArgument(_) => Code::InvalidArgument,
            CoreError::RouteTimeout(_) => Code::DeadlineExceeded,
            CoreError::Unavailable(_) | CoreError::ConnectionClosed(_) => Code::Unavailable,
            CoreError::Unimplemented(_) => Code::Unimplemented,
            CoreError::ReloadRestartRequired(_) | CoreError::ReloadRejected(_) => {
                Code::FailedPrecondition
            }
            CoreError::InvalidCommand { .. }
            | CoreError::ExecutableNotFound(_)
            | CoreError::PermissionDenied(_)
            | CoreError::Internal(_) => Code::Internal,
        };
        Status::new(code, err.to_string())
    }
}

// ── Wire types ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub caller: String,
    pub pid: u32,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallerRequest {
    pub caller: String,
}

/// A full snapshot of one entity kind, as sent on list and watch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotWire<T> {
    pub etag: ETag,
    pub items: Vec<T>,
}

impl<T: EntityItem> From<FilteredSnapshot<T>> for SnapshotWire<T> {
    fn from(snapshot: FilteredSnapshot<T>) -> Self {
        Self {
            etag: snapshot.etag,
            items: snapshot.items.as_ref().clone(),
        }
    }
}

/// One page of a cursor-paginated listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageWire<T> {
    pub etag: ETag,
    pub items: Vec<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

impl<T: EntityItem> From<Page<T>> for PageWire<T> {
    fn from(page: Page<T>) -> Self {
        Self {
            etag: page.etag,
            items: page.items,
            next_cursor: page.next_cursor,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PagedListRequest {
    pub caller: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallToolRequest {
    pub caller: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<JsonObject>,
    #[serde(default)]
    pub routing_key: String,
}

/// Results of tool calls / resource reads / prompt gets travel as the rmcp
/// result JSON, untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultWire {
    pub result: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadResourceRequest {
    pub caller: String,
    pub uri: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetPromptRequest {
    pub caller: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<JsonObject>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubAgentResponse {
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WatchQuery {
    pub caller: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_etag: Option<ETag>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogsQuery {
    pub caller: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_level: Option<LogLevel>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReloadResponse {
    pub revision: u64,
}
