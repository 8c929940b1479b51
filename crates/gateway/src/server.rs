//! The MCP server the IDE talks to: listings come from the mirrored view,
//! calls are forwarded to the control plane.

use crate::client::ClientManager;
use crate::view::MirrorView;
use corral::rpc::client::RpcError;
use corral::rpc::Code;
use corral::runtime::{PromptEntry, ResourceEntry, ToolEntry};
use rmcp::model::{
    AnnotateAble, CallToolRequestParam, CallToolResult, ErrorCode, GetPromptRequestParam,
    GetPromptResult, Implementation, ListPromptsResult, ListResourcesResult, ListToolsResult,
    PaginatedRequestParam, Prompt, PromptArgument, RawResource, ReadResourceRequestParam,
    ReadResourceResult, Resource, ServerCapabilities, ServerInfo, Tool,
};
use rmcp::service::{RequestContext, RoleServer};
use rmcp::{ErrorData, ServerHandler};
use serde_json::Value;
use std::borrow::Cow;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::warn;

/// How long the first `tools/list` may block waiting for the initial sync.
const TOOLS_READY_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone)]
pub struct GatewayServer {
    view: Arc<MirrorView>,
    manager: Arc<ClientManager>,
    caller: String,
    cold_start_logged: Arc<AtomicBool>,
}

impl GatewayServer {
    pub fn new(view: Arc<MirrorView>, manager: Arc<ClientManager>, caller: String) -> Self {
        Self {
            view,
            manager,
            caller,
            cold_start_logged: Arc::new(AtomicBool::new(false)),
        }
    }
}

fn to_error_data(err: RpcError) -> ErrorData {
    let code = match err.code() {
        Code::NotFound | Code::InvalidArgument => ErrorCode::INVALID_PARAMS,
        _ => ErrorCode::INTERNAL_ERROR,
    };
    ErrorData::new(code, err.to_string(), None)
}

fn malformed(err: serde_json::Error) -> ErrorData {
    ErrorData::new(
        ErrorCode::INTERNAL_ERROR,
        format!("malformed control-plane result: {err}"),
        None,
    )
}

fn to_tool(entry: &ToolEntry) -> Tool {
    let schema = match &entry.input_schema {
        Value::Object(map) => map.clone(),
        _ => rmcp::model::JsonObject::new(),
    };
    let mut tool = Tool::new(entry.name.clone(), String::new(), Arc::new(schema));
    tool.description = entry.description.clone().map(Cow::Owned);
    tool.output_schema = entry.output_schema.as_ref().and_then(|schema| match schema {
        Value::Object(map) => Some(Arc::new(map.clone())),
        _ => None,
    });
    tool
}

fn to_resource(entry: &ResourceEntry) -> Resource {
    let mut raw = RawResource::new(entry.uri.clone(), entry.name.clone());
    raw.description = entry.description.clone();
    raw.mime_type = entry.mime_type.clone();
    raw.no_annotation()
}

fn to_prompt(entry: &PromptEntry) -> Prompt {
    let arguments: Option<Vec<PromptArgument>> = entry
        .arguments
        .as_ref()
        .and_then(|value| serde_json::from_value(value.clone()).ok());
    Prompt::new(entry.name.clone(), entry.description.as_deref(), arguments)
}

impl ServerHandler for GatewayServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo::new(
            ServerCapabilities::builder()
                .enable_tools()
                .enable_tool_list_changed()
                .enable_resources()
                .enable_prompts()
                .enable_logging()
                .build(),
        )
        .with_server_info(Implementation::new(
            "corral-gateway",
            env!("CARGO_PKG_VERSION"),
        ))
        .with_instructions(format!(
            "Tools, resources and prompts visible to caller '{}' via the corral control plane.",
            self.caller
        ))
    }

    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, ErrorData> {
        // Avoid answering an empty set during cold start.
        if !self.view.wait_tools_ready(TOOLS_READY_TIMEOUT).await
            && !self.cold_start_logged.swap(true, Ordering::SeqCst)
        {
            warn!("tools/list served before the first sync completed");
        }
        Ok(ListToolsResult {
            meta: None,
            tools: self.view.tools().iter().map(to_tool).collect(),
            next_cursor: None,
        })
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, ErrorData> {
        let caller = self.caller.clone();
        let name = request.name.to_string();
        let arguments = request.arguments;
        let value = self
            .manager
            .with_reregister(move |client| {
                let caller = caller.clone();
                let name = name.clone();
                let arguments = arguments.clone();
                async move { client.call_tool(&caller, &name, arguments, "").await }
            })
            .await
            .map_err(to_error_data)?;
        serde_json::from_value(value).map_err(malformed)
    }

    async fn list_resources(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListResourcesResult, ErrorData> {
        Ok(ListResourcesResult {
            meta: None,
            resources: self.view.resources().iter().map(to_resource).collect(),
            next_cursor: None,
        })
    }

    async fn read_resource(
        &self,
        request: ReadResourceRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<ReadResourceResult, ErrorData> {
        let caller = self.caller.clone();
        let uri = request.uri.clone();
        let value = self
            .manager
            .with_reregister(move |client| {
                let caller = caller.clone();
                let uri = uri.clone();
                async move { client.read_resource(&caller, &uri).await }
            })
            .await
            .map_err(to_error_data)?;
        serde_json::from_value(value).map_err(malformed)
    }

    async fn list_prompts(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListPromptsResult, ErrorData> {
        Ok(ListPromptsResult {
            meta: None,
            prompts: self.view.prompts().iter().map(to_prompt).collect(),
            next_cursor: None,
        })
    }

    async fn get_prompt(
        &self,
        request: GetPromptRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<GetPromptResult, ErrorData> {
        let caller = self.caller.clone();
        let name = request.name.to_string();
        let arguments = request.arguments;
        let value = self
            .manager
            .with_reregister(move |client| {
                let caller = caller.clone();
                let name = name.clone();
                let arguments = arguments.clone();
                async move { client.get_prompt(&caller, &name, arguments).await }
            })
            .await
            .map_err(to_error_data)?;
        serde_json::from_value(value).map_err(malformed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tool_conversion_keeps_schema_and_description() {
        let entry = ToolEntry {
            spec_key: corral::hash::ContentHash::of_bytes(b"k"),
            server_name: "git".into(),
            name: "git_status".into(),
            description: Some("repo status".into()),
            input_schema: json!({"type": "object", "properties": {"path": {"type": "string"}}}),
            output_schema: None,
        };
        let tool = to_tool(&entry);
        assert_eq!(tool.name, "git_status");
        assert_eq!(tool.description.as_deref(), Some("repo status"));
        assert!(tool.input_schema.contains_key("properties"));
        assert!(tool.output_schema.is_none());
    }

    #[test]
    fn prompt_arguments_round_trip() {
        let entry = PromptEntry {
            spec_key: corral::hash::ContentHash::of_bytes(b"k"),
            server_name: "git".into(),
            name: "commit".into(),
            description: None,
            arguments: Some(json!([{"name": "scope", "required": true}])),
        };
        let prompt = to_prompt(&entry);
        let args = prompt.arguments.unwrap();
        assert_eq!(args.len(), 1);
        assert_eq!(args[0].name, "scope");
    }

    #[test]
    fn rpc_errors_map_to_mcp_error_codes() {
        let not_found = RpcError::Status(corral::rpc::Status::new(Code::NotFound, "no tool"));
        assert_eq!(to_error_data(not_found).code, ErrorCode::INVALID_PARAMS);
        let transport = RpcError::Transport("gone".into());
        assert_eq!(to_error_data(transport).code, ErrorCode::INTERNAL_ERROR);
    }
}
