//! MCP wire types: JSON-RPC 2.0 framing plus the tool-facing shapes
//! from the Model Context Protocol.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Protocol revision sent in the `initialize` handshake.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Separator between server name and tool name in advertised tool names.
pub const NAMESPACE_SEPARATOR: &str = "__";

#[derive(Debug, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method: method.into(),
            params,
        }
    }
}

/// A one-way message; carries no id and expects no reply.
#[derive(Debug, Serialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: &'static str,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0",
            method: method.into(),
            params: None,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct JsonRpcResponse {
    #[allow(dead_code)]
    pub jsonrpc: String,
    /// Absent on server-initiated notifications, which we skip.
    pub id: Option<u64>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    #[allow(dead_code)]
    pub data: Option<Value>,
}

/// One tool as described by a `tools/list` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpToolInfo {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "inputSchema", alias = "input_schema", default)]
    pub input_schema: Option<Value>,
}

/// Outcome of a `tools/call`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpToolResult {
    #[serde(default)]
    pub content: Vec<McpContent>,
    #[serde(rename = "isError", default)]
    pub is_error: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpContent {
    #[serde(rename = "type")]
    pub content_type: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub data: Option<String>,
    #[serde(rename = "mimeType", default)]
    pub mime_type: Option<String>,
}

impl McpToolResult {
    /// Flatten the text parts into one string. Non-text parts are
    /// represented by their content type so nothing disappears silently.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .map(|part| match &part.text {
                Some(text) => text.clone(),
                None => format!("[{} content]", part.content_type),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Params for the `initialize` request.
pub fn initialize_params() -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {
            "tools": {}
        },
        "clientInfo": {
            "name": "capstan",
            "version": env!("CARGO_PKG_VERSION")
        }
    })
}

/// Params for a `tools/call` request.
pub fn tools_call_params(tool_name: &str, arguments: &Value) -> Value {
    json!({
        "name": tool_name,
        "arguments": arguments
    })
}

/// The advertised name for a remote tool: `server__tool`.
pub fn namespaced(server: &str, tool: &str) -> String {
    format!("{server}{NAMESPACE_SEPARATOR}{tool}")
}

/// Split an advertised name back into (server, tool). Returns `None`
/// for names that carry no namespace.
pub fn split_namespaced(name: &str) -> Option<(&str, &str)> {
    name.split_once(NAMESPACE_SEPARATOR)
}
