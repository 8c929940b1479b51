//! Wire-friendly entity entries: tools, resources, prompts.
//!
//! Entries are plain serde structs rather than rmcp model types so snapshot
//! ETags hash a canonical form the gateway reproduces bit-for-bit.

use crate::catalog::SpecKey;
use rmcp::model::{Prompt, RawResource, Tool};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Common shape shared by the three entity kinds.
pub trait EntityItem: Clone + Serialize + Send + Sync + 'static {
    const KIND: &'static str;

    /// The client-facing identity: tool name, resource URI, prompt name.
    /// Doubles as the pagination cursor.
    fn item_key(&self) -> &str;
    fn server_name(&self) -> &str;
    fn spec_key(&self) -> SpecKey;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolEntry {
    pub spec_key: SpecKey,
    pub server_name: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub input_schema: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
}

impl ToolEntry {
    pub fn from_tool(spec_key: SpecKey, server_name: &str, tool: &Tool) -> Self {
        Self {
            spec_key,
            server_name: server_name.to_string(),
            name: tool.name.to_string(),
            description: tool.description.as_ref().map(|d| d.to_string()),
            input_schema: Value::Object((*tool.input_schema).clone()),
            output_schema: tool
                .output_schema
                .as_ref()
                .map(|s| Value::Object((**s).clone())),
        }
    }

    /// Whether a tool schema is object-typed. Non-object schemas are invalid
    /// for MCP tools and their tools get skipped with a warning; a missing
    /// `type` is treated as object.
    pub fn schema_is_object(schema: &Value) -> bool {
        match schema.get("type") {
            None => true,
            Some(Value::String(t)) => t == "object",
            Some(_) => false,
        }
    }
}

impl EntityItem for ToolEntry {
    const KIND: &'static str = "tools";

    fn item_key(&self) -> &str {
        &self.name
    }

    fn server_name(&self) -> &str {
        &self.server_name
    }

    fn spec_key(&self) -> SpecKey {
        self.spec_key
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceEntry {
    pub spec_key: SpecKey,
    pub server_name: String,
    pub uri: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

impl ResourceEntry {
    pub fn from_resource(spec_key: SpecKey, server_name: &str, resource: &RawResource) -> Self {
        Self {
            spec_key,
            server_name: server_name.to_string(),
            uri: resource.uri.clone(),
            name: resource.name.clone(),
            description: resource.description.clone(),
            mime_type: resource.mime_type.clone(),
        }
    }
}

impl EntityItem for ResourceEntry {
    const KIND: &'static str = "resources";

    fn item_key(&self) -> &str {
        &self.uri
    }

    fn server_name(&self) -> &str {
        &self.server_name
    }

    fn spec_key(&self) -> SpecKey {
        self.spec_key
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptEntry {
    pub spec_key: SpecKey,
    pub server_name: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
}

impl PromptEntry {
    pub fn from_prompt(spec_key: SpecKey, server_name: &str, prompt: &Prompt) -> Self {
        Self {
            spec_key,
            server_name: server_name.to_string(),
            name: prompt.name.clone(),
            description: prompt.description.clone(),
            arguments: prompt
                .arguments
                .as_ref()
                .and_then(|args| serde_json::to_value(args).ok()),
        }
    }
}

impl EntityItem for PromptEntry {
    const KIND: &'static str = "prompts";

    fn item_key(&self) -> &str {
        &self.name
    }

    fn server_name(&self) -> &str {
        &self.server_name
    }

    fn spec_key(&self) -> SpecKey {
        self.spec_key
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn object_schema_detection() {
        assert!(ToolEntry::schema_is_object(&json!({"type": "object"})));
        assert!(ToolEntry::schema_is_object(&json!({"properties": {}})));
        assert!(!ToolEntry::schema_is_object(&json!({"type": "string"})));
        assert!(!ToolEntry::schema_is_object(&json!({"type": 3})));
    }

    #[test]
    fn tool_entry_round_trips_through_json() {
        let entry = ToolEntry {
            spec_key: crate::hash::ContentHash::of_bytes(b"k"),
            server_name: "git".into(),
            name: "git_status".into(),
            description: Some("status".into()),
            input_schema: json!({"type": "object"}),
            output_schema: None,
        };
        let text = serde_json::to_string(&entry).unwrap();
        let back: ToolEntry = serde_json::from_str(&text).unwrap();
        assert_eq!(entry, back);
    }
}
