use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

/// One entry of a `tool_manifest` message, before the registry applies
/// delegate-scoped namespacing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolManifestEntry {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub input_schema: Value,
    #[serde(default)]
    pub server_name: Option<String>,
}

/// Result payload of a `tool_call_response`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallResult {
    pub content: ToolCallContent,
    #[serde(default)]
    pub is_error: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolCallContent {
    Text(String),
    Blocks(Vec<Value>),
}
