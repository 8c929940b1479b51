//! Control-plane client: unary JSON calls plus SSE stream decoding.

use super::{
    CallToolRequest, CallerRequest, Code, GetPromptRequest, PageWire, PagedListRequest,
    ReadResourceRequest, RegisterRequest, ResultWire, SnapshotWire, Status, SubAgentResponse,
};
use crate::logs::{LogEntry, LogLevel};
use crate::runtime::{ETag, PromptEntry, ResourceEntry, ToolEntry};
use futures::StreamExt;
use rmcp::model::JsonObject;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::pin::Pin;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RpcError {
    /// The server answered with a status envelope.
    #[error("{0}")]
    Status(Status),
    /// The request never completed; the connection should be re-dialed.
    #[error("transport: {0}")]
    Transport(String),
}

impl RpcError {
    pub fn code(&self) -> Code {
        match self {
            RpcError::Status(status) => status.code,
            RpcError::Transport(_) => Code::Unavailable,
        }
    }

    pub fn is_failed_precondition(&self) -> bool {
        self.code() == Code::FailedPrecondition
    }

    pub fn is_unavailable(&self) -> bool {
        self.code() == Code::Unavailable
    }
}

impl From<reqwest::Error> for RpcError {
    fn from(err: reqwest::Error) -> Self {
        RpcError::Transport(err.to_string())
    }
}

/// One connection to the control plane. Cheap to clone per reqwest's own
/// pooling; `ClientManager`-style wrappers drop the whole value to force a
/// re-dial.
#[derive(Clone)]
pub struct ControlClient {
    base: String,
    http: reqwest::Client,
    token: Option<String>,
}

impl ControlClient {
    pub fn new(base: impl Into<String>, token: Option<String>) -> Result<Self, RpcError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| RpcError::Transport(e.to_string()))?;
        Ok(Self {
            base: base.into().trim_end_matches('/').to_string(),
            http,
            token,
        })
    }

    /// Build over a pre-configured reqwest client (extra root CAs, custom
    /// timeouts).
    pub fn with_http(base: impl Into<String>, token: Option<String>, http: reqwest::Client) -> Self {
        Self {
            base: base.into().trim_end_matches('/').to_string(),
            http,
            token,
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    async fn post<B: Serialize, R: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<R, RpcError> {
        let mut request = self.http.post(format!("{}{path}", self.base)).json(body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;
        if response.status().is_success() {
            return Ok(response.json().await?);
        }
        let status: Status = response
            .json()
            .await
            .unwrap_or_else(|e| Status::new(Code::Internal, format!("malformed status: {e}")));
        Err(RpcError::Status(status))
    }

    async fn stream<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<SseStream<T>, RpcError> {
        let mut request = self.http.get(format!("{}{path}", self.base)).query(query);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            let status: Status = response
                .json()
                .await
                .unwrap_or_else(|e| Status::new(Code::Internal, format!("malformed status: {e}")));
            return Err(RpcError::Status(status));
        }
        Ok(SseStream {
            bytes: Box::pin(response.bytes_stream()),
            buffer: String::new(),
            _marker: PhantomData,
        })
    }

    // ── Unary surface ───────────────────────────────────────────────────

    pub async fn register(
        &self,
        caller: &str,
        pid: u32,
        tags: &[String],
        server: Option<&str>,
    ) -> Result<(), RpcError> {
        let _: serde_json::Value = self
            .post(
                "/v1/register",
                &RegisterRequest {
                    caller: caller.to_string(),
                    pid,
                    tags: tags.to_vec(),
                    server: server.map(String::from),
                },
            )
            .await?;
        Ok(())
    }

    pub async fn unregister(&self, caller: &str) -> Result<(), RpcError> {
        let _: serde_json::Value = self
            .post(
                "/v1/unregister",
                &CallerRequest {
                    caller: caller.to_string(),
                },
            )
            .await?;
        Ok(())
    }

    pub async fn list_tools(&self, caller: &str) -> Result<SnapshotWire<ToolEntry>, RpcError> {
        self.post(
            "/v1/tools/list",
            &CallerRequest {
                caller: caller.to_string(),
            },
        )
        .await
    }

    pub async fn call_tool(
        &self,
        caller: &str,
        name: &str,
        arguments: Option<JsonObject>,
        routing_key: &str,
    ) -> Result<serde_json::Value, RpcError> {
        let wire: ResultWire = self
            .post(
                "/v1/tools/call",
                &CallToolRequest {
                    caller: caller.to_string(),
                    name: name.to_string(),
                    arguments,
                    routing_key: routing_key.to_string(),
                },
            )
            .await?;
        Ok(wire.result)
    }

    pub async fn list_resources(
        &self,
        caller: &str,
        cursor: Option<String>,
    ) -> Result<PageWire<ResourceEntry>, RpcError> {
        self.post(
            "/v1/resources/list",
            &PagedListRequest {
                caller: caller.to_string(),
                cursor,
            },
        )
        .await
    }

    pub async fn read_resource(
        &self,
        caller: &str,
        uri: &str,
    ) -> Result<serde_json::Value, RpcError> {
        let wire: ResultWire = self
            .post(
                "/v1/resources/read",
                &ReadResourceRequest {
                    caller: caller.to_string(),
                    uri: uri.to_string(),
                },
            )
            .await?;
        Ok(wire.result)
    }

    pub async fn list_prompts(
        &self,
        caller: &str,
        cursor: Option<String>,
    ) -> Result<PageWire<PromptEntry>, RpcError> {
        self.post(
            "/v1/prompts/list",
            &PagedListRequest {
                caller: caller.to_string(),
                cursor,
            },
        )
        .await
    }

    pub async fn get_prompt(
        &self,
        caller: &str,
        name: &str,
        arguments: Option<JsonObject>,
    ) -> Result<serde_json::Value, RpcError> {
        let wire: ResultWire = self
            .post(
                "/v1/prompts/get",
                &GetPromptRequest {
                    caller: caller.to_string(),
                    name: name.to_string(),
                    arguments,
                },
            )
            .await?;
        Ok(wire.result)
    }

    pub async fn is_sub_agent_enabled(&self, caller: &str) -> Result<bool, RpcError> {
        let response: SubAgentResponse = self
            .post(
                "/v1/subagent",
                &CallerRequest {
                    caller: caller.to_string(),
                },
            )
            .await?;
        Ok(response.enabled)
    }

    // ── Streams ─────────────────────────────────────────────────────────

    pub async fn watch_tools(
        &self,
        caller: &str,
        last_etag: Option<ETag>,
    ) -> Result<SseStream<SnapshotWire<ToolEntry>>, RpcError> {
        self.watch("/v1/tools/watch", caller, last_etag).await
    }

    pub async fn watch_resources(
        &self,
        caller: &str,
        last_etag: Option<ETag>,
    ) -> Result<SseStream<SnapshotWire<ResourceEntry>>, RpcError> {
        self.watch("/v1/resources/watch", caller, last_etag).await
    }

    pub async fn watch_prompts(
        &self,
        caller: &str,
        last_etag: Option<ETag>,
    ) -> Result<SseStream<SnapshotWire<PromptEntry>>, RpcError> {
        self.watch("/v1/prompts/watch", caller, last_etag).await
    }

    async fn watch<T: DeserializeOwned>(
        &self,
        path: &str,
        caller: &str,
        last_etag: Option<ETag>,
    ) -> Result<SseStream<T>, RpcError> {
        let mut query = vec![("caller", caller.to_string())];
        if let Some(etag) = last_etag {
            query.push(("last_etag", etag.to_hex()));
        }
        self.stream(path, &query).await
    }

    pub async fn stream_logs(
        &self,
        caller: &str,
        min_level: LogLevel,
    ) -> Result<SseStream<LogEntry>, RpcError> {
        let level = serde_json::to_value(min_level)
            .ok()
            .and_then(|v| v.as_str().map(String::from))
            .unwrap_or_else(|| "info".to_string());
        self.stream(
            "/v1/logs/stream",
            &[("caller", caller.to_string()), ("min_level", level)],
        )
        .await
    }
}

/// Minimal SSE decoder over a reqwest byte stream: frames split on blank
/// lines, `data:` lines parsed as JSON, comments and keep-alives skipped.
pub struct SseStream<T> {
    bytes: Pin<Box<dyn futures::Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send>>,
    buffer: String,
    _marker: PhantomData<T>,
}

impl<T: DeserializeOwned> SseStream<T> {
    /// Next decoded event; `None` when the server closed the stream.
    pub async fn next(&mut self) -> Option<Result<T, RpcError>> {
        loop {
            if let Some(frame) = self.take_frame() {
                if let Some(data) = frame_data(&frame) {
                    return Some(
                        serde_json::from_str(&data).map_err(|e| {
                            RpcError::Transport(format!("malformed event: {e}"))
                        }),
                    );
                }
                continue;
            }
            match self.bytes.next().await {
                Some(Ok(chunk)) => self.buffer.push_str(&String::from_utf8_lossy(&chunk)),
                Some(Err(err)) => return Some(Err(RpcError::Transport(err.to_string()))),
                None => return None,
            }
        }
    }

    fn take_frame(&mut self) -> Option<String> {
        let boundary = self.buffer.find("\n\n")?;
        let frame = self.buffer[..boundary].to_string();
        self.buffer.drain(..boundary + 2);
        Some(frame)
    }
}

fn frame_data(frame: &str) -> Option<String> {
    let data: Vec<&str> = frame
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|line| line.strip_prefix(' ').unwrap_or(line))
        .collect();
    if data.is_empty() {
        None
    } else {
        Some(data.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_data_extracts_payload_lines() {
        assert_eq!(
            frame_data("data: {\"a\":1}").as_deref(),
            Some("{\"a\":1}")
        );
        assert_eq!(frame_data(": keep-alive"), None);
        assert_eq!(
            frame_data("event: message\ndata: one\ndata: two").as_deref(),
            Some("one\ntwo")
        );
    }

    #[tokio::test]
    async fn sse_stream_decodes_frames_across_chunk_boundaries() {
        let chunks: Vec<Result<bytes::Bytes, reqwest::Error>> = vec![
            Ok(bytes::Bytes::from_static(b"data: {\"seq\":1,\"level\":\"info\",")),
            Ok(bytes::Bytes::from_static(
                b"\"target\":\"t\",\"message\":\"m\",\"ts_millis\":0}\n\n: ping\n\n",
            )),
            Ok(bytes::Bytes::from_static(
                b"data: {\"seq\":2,\"level\":\"warn\",\"target\":\"t\",\"message\":\"n\",\"ts_millis\":0}\n\n",
            )),
        ];
        let mut stream: SseStream<LogEntry> = SseStream {
            bytes: Box::pin(futures::stream::iter(chunks)),
            buffer: String::new(),
            _marker: PhantomData,
        };

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.seq, 1);
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(second.seq, 2);
        assert!(stream.next().await.is_none());
    }
}
