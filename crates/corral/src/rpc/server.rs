//! Axum router implementing the Control service.

use super::{
    CallToolRequest, CallerRequest, Code, GetPromptRequest, LogsQuery, PagedListRequest,
    ReadResourceRequest, RegisterRequest, ReloadResponse, ResultWire, SnapshotWire, Status,
    SubAgentResponse, WatchQuery,
};
use crate::control::ControlPlane;
use crate::discovery::FilteredSnapshot;
use crate::logs::LogLevel;
use crate::runtime::{ETag, EntityItem};
use axum::extract::{Query, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::Stream;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::{BroadcastStream, WatchStream};
use tokio_stream::StreamExt as _;

impl IntoResponse for Status {
    fn into_response(self) -> Response {
        let http = StatusCode::from_u16(self.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (http, Json(self)).into_response()
    }
}

/// Build the Control router. All routes sit behind the bearer-token check
/// when the control plane carries one.
pub fn router(control: Arc<ControlPlane>) -> Router {
    Router::new()
        .route("/v1/register", post(register))
        .route("/v1/unregister", post(unregister))
        .route("/v1/tools/list", post(list_tools))
        .route("/v1/tools/call", post(call_tool))
        .route("/v1/tools/watch", get(watch_tools))
        .route("/v1/resources/list", post(list_resources))
        .route("/v1/resources/read", post(read_resource))
        .route("/v1/resources/watch", get(watch_resources))
        .route("/v1/prompts/list", post(list_prompts))
        .route("/v1/prompts/get", post(get_prompt))
        .route("/v1/prompts/watch", get(watch_prompts))
        .route("/v1/logs/stream", get(stream_logs))
        .route("/v1/subagent", post(sub_agent_enabled))
        .route("/v1/pools", get(pool_status))
        .route("/v1/reload", post(reload))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&control),
            check_bearer,
        ))
        .with_state(control)
}

async fn check_bearer(
    State(control): State<Arc<ControlPlane>>,
    request: Request,
    next: Next,
) -> Response {
    if let Some(expected) = &control.auth_token {
        let presented = request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "));
        if presented != Some(expected.as_str()) {
            return Status::new(Code::FailedPrecondition, "missing or invalid bearer token")
                .into_response();
        }
    }
    next.run(request).await
}

async fn register(
    State(control): State<Arc<ControlPlane>>,
    Json(request): Json<RegisterRequest>,
) -> Result<Json<serde_json::Value>, Status> {
    control
        .registry
        .register(
            &request.caller,
            request.pid,
            &request.tags,
            request.server.as_deref(),
        )
        .await?;
    Ok(Json(serde_json::json!({})))
}

async fn unregister(
    State(control): State<Arc<ControlPlane>>,
    Json(request): Json<CallerRequest>,
) -> Result<Json<serde_json::Value>, Status> {
    control.registry.unregister(&request.caller).await?;
    Ok(Json(serde_json::json!({})))
}

async fn list_tools(
    State(control): State<Arc<ControlPlane>>,
    Json(request): Json<CallerRequest>,
) -> Result<Json<SnapshotWire<crate::runtime::ToolEntry>>, Status> {
    let snapshot = control.discovery.list_tools(&request.caller)?;
    Ok(Json(snapshot.into()))
}

async fn call_tool(
    State(control): State<Arc<ControlPlane>>,
    Json(request): Json<CallToolRequest>,
) -> Result<Json<ResultWire>, Status> {
    let result = control
        .discovery
        .call_tool(
            &request.caller,
            &request.name,
            request.arguments,
            &request.routing_key,
        )
        .await?;
    Ok(Json(ResultWire {
        result: serde_json::to_value(result).map_err(crate::error::CoreError::from)?,
    }))
}

async fn list_resources(
    State(control): State<Arc<ControlPlane>>,
    Json(request): Json<PagedListRequest>,
) -> Result<Json<super::PageWire<crate::runtime::ResourceEntry>>, Status> {
    let page = control
        .discovery
        .list_resources(&request.caller, request.cursor.as_deref())?;
    Ok(Json(page.into()))
}

async fn read_resource(
    State(control): State<Arc<ControlPlane>>,
    Json(request): Json<ReadResourceRequest>,
) -> Result<Json<ResultWire>, Status> {
    let result = control
        .discovery
        .read_resource(&request.caller, &request.uri)
        .await?;
    Ok(Json(ResultWire {
        result: serde_json::to_value(result).map_err(crate::error::CoreError::from)?,
    }))
}

async fn list_prompts(
    State(control): State<Arc<ControlPlane>>,
    Json(request): Json<PagedListRequest>,
) -> Result<Json<super::PageWire<crate::runtime::PromptEntry>>, Status> {
    let page = control
        .discovery
        .list_prompts(&request.caller, request.cursor.as_deref())?;
    Ok(Json(page.into()))
}

async fn get_prompt(
    State(control): State<Arc<ControlPlane>>,
    Json(request): Json<GetPromptRequest>,
) -> Result<Json<ResultWire>, Status> {
    let result = control
        .discovery
        .get_prompt(&request.caller, &request.name, request.arguments)
        .await?;
    Ok(Json(ResultWire {
        result: serde_json::to_value(result).map_err(crate::error::CoreError::from)?,
    }))
}

async fn sub_agent_enabled(
    State(control): State<Arc<ControlPlane>>,
    Json(request): Json<CallerRequest>,
) -> Result<Json<SubAgentResponse>, Status> {
    control.ensure_registered(&request.caller)?;
    Ok(Json(SubAgentResponse {
        enabled: control.sub_agent_enabled(),
    }))
}

async fn pool_status(
    State(control): State<Arc<ControlPlane>>,
) -> Json<Vec<crate::scheduler::PoolInfo>> {
    Json(control.scheduler.pool_status().await)
}

async fn reload(
    State(control): State<Arc<ControlPlane>>,
) -> Result<Json<ReloadResponse>, Status> {
    let revision = control.reload.reload().await?;
    Ok(Json(ReloadResponse { revision }))
}

// ── Streams ─────────────────────────────────────────────────────────────────

/// Turn a per-client snapshot stream into SSE, suppressing the initial frame
/// when the caller already holds it. The watch stream always yields the
/// latest revision, so a slow consumer skips intermediates without going
/// stale.
fn sse_snapshots<T: EntityItem>(
    rx: watch::Receiver<FilteredSnapshot<T>>,
    last_etag: Option<ETag>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut first = Some(last_etag);
    let stream = WatchStream::new(rx).filter_map(move |snapshot| {
        let wire: SnapshotWire<T> = snapshot.into();
        if first.take().flatten() == Some(wire.etag) {
            return None;
        }
        Event::default().json_data(&wire).ok().map(Ok::<_, Infallible>)
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn watch_tools(
    State(control): State<Arc<ControlPlane>>,
    Query(query): Query<WatchQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, Status> {
    let rx = control.discovery.watch_tools(&query.caller)?;
    Ok(sse_snapshots(rx, query.last_etag))
}

async fn watch_resources(
    State(control): State<Arc<ControlPlane>>,
    Query(query): Query<WatchQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, Status> {
    let rx = control.discovery.watch_resources(&query.caller)?;
    Ok(sse_snapshots(rx, query.last_etag))
}

async fn watch_prompts(
    State(control): State<Arc<ControlPlane>>,
    Query(query): Query<WatchQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, Status> {
    let rx = control.discovery.watch_prompts(&query.caller)?;
    Ok(sse_snapshots(rx, query.last_etag))
}

async fn stream_logs(
    State(control): State<Arc<ControlPlane>>,
    Query(query): Query<LogsQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, Status> {
    control.ensure_registered(&query.caller)?;
    let min_level = query.min_level.unwrap_or(LogLevel::Info);
    let stream = BroadcastStream::new(control.logs.subscribe()).filter_map(move |entry| {
        match entry {
            Ok(entry) if entry.level >= min_level => {
                Event::default().json_data(&entry).ok().map(Ok::<_, Infallible>)
            }
            Ok(_) => None,
            // A lagged subscriber just misses entries; the stream continues.
            Err(BroadcastStreamRecvError::Lagged(_)) => None,
        }
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
