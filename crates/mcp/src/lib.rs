//! MCP client: connect to remote tool servers, cache their catalogs,
//! and forward tool calls.
//!
//! Connections live in an explicit [`ConnectionManager`] owned by the
//! process root; there is no global registry. `connect` performs the
//! full handshake (initialize, initialized notification, tools/list)
//! and caches the discovered tools under namespaced names. A server
//! that was never connected, or that has been disconnected, fails fast;
//! nothing reconnects implicitly.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Value, json};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use capstan_config::RemoteServerConfig;
use capstan_core::error::RemoteError;
use capstan_core::tool::{ToolDefinition, ToolEnvironment};

pub mod protocol;
pub mod transport;

pub use protocol::{McpContent, McpToolInfo, McpToolResult, namespaced, split_namespaced};

use transport::ServerTransport;

struct ServerEntry {
    timeout_ms: u64,
    tools: Vec<ToolDefinition>,
    /// Held across the request await, so a hung server only blocks its
    /// own callers.
    transport: Arc<Mutex<ServerTransport>>,
}

/// Owns every remote server connection and the cached tool catalogs.
#[derive(Default)]
pub struct ConnectionManager {
    connections: RwLock<HashMap<String, ServerEntry>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Connect to a server, run the MCP handshake, and cache its tools.
    ///
    /// Fails if `name` is already connected. Any handshake failure
    /// closes the partially-opened transport before the error
    /// propagates, so no half-connected child lingers.
    pub async fn connect(
        &self,
        name: &str,
        config: &RemoteServerConfig,
    ) -> Result<Vec<ToolDefinition>, RemoteError> {
        {
            let connections = self.connections.read().await;
            if connections.contains_key(name) {
                return Err(RemoteError::ConnectFailed {
                    server: name.to_string(),
                    reason: "already connected".into(),
                });
            }
        }

        let mut transport = ServerTransport::open(name, &config.transport)?;

        if let Err(e) = transport
            .request(
                "initialize",
                Some(protocol::initialize_params()),
                config.timeout_ms,
            )
            .await
        {
            transport.close().await;
            return Err(RemoteError::ConnectFailed {
                server: name.to_string(),
                reason: format!("initialize failed: {e}"),
            });
        }

        if let Err(e) = transport
            .notify("notifications/initialized", config.timeout_ms)
            .await
        {
            warn!(server = name, error = %e, "Failed to send initialized notification");
        }

        let list = match transport.request("tools/list", None, config.timeout_ms).await {
            Ok(list) => list,
            Err(e) => {
                transport.close().await;
                return Err(RemoteError::ConnectFailed {
                    server: name.to_string(),
                    reason: format!("tools/list failed: {e}"),
                });
            }
        };

        let tools = parse_tool_list(name, &list);
        let definitions: Vec<ToolDefinition> = tools
            .iter()
            .map(|info| ToolDefinition {
                name: protocol::namespaced(name, &info.name),
                description: info.description.clone().unwrap_or_default(),
                parameters_schema: info
                    .input_schema
                    .clone()
                    .unwrap_or_else(|| json!({"type": "object"})),
                returns_schema: None,
                timeout_ms: config.timeout_ms,
                enabled: true,
                environment: ToolEnvironment::Remote {
                    server: name.to_string(),
                    remote_name: info.name.clone(),
                },
            })
            .collect();

        {
            let mut connections = self.connections.write().await;
            if connections.contains_key(name) {
                drop(connections);
                transport.close().await;
                return Err(RemoteError::ConnectFailed {
                    server: name.to_string(),
                    reason: "already connected".into(),
                });
            }
            connections.insert(
                name.to_string(),
                ServerEntry {
                    timeout_ms: config.timeout_ms,
                    tools: definitions.clone(),
                    transport: Arc::new(Mutex::new(transport)),
                },
            );
        }

        info!(server = name, tools = definitions.len(), "Connected to remote tool server");
        Ok(definitions)
    }

    /// Call a tool by its un-namespaced remote name on a connected
    /// server. Fails fast with `NotConnected` when the server is
    /// unknown; there is no implicit reconnect.
    pub async fn execute(
        &self,
        server: &str,
        remote_name: &str,
        arguments: &Value,
    ) -> Result<McpToolResult, RemoteError> {
        let (transport, timeout_ms) = {
            let connections = self.connections.read().await;
            match connections.get(server) {
                Some(entry) => (Arc::clone(&entry.transport), entry.timeout_ms),
                None => return Err(RemoteError::NotConnected(server.to_string())),
            }
        };

        debug!(server, tool = remote_name, "Forwarding tool call");
        let params = protocol::tools_call_params(remote_name, arguments);
        let result = {
            let mut transport = transport.lock().await;
            transport
                .request("tools/call", Some(params), timeout_ms)
                .await?
        };

        serde_json::from_value::<McpToolResult>(result).map_err(|e| RemoteError::Transport {
            server: server.to_string(),
            reason: format!("unparseable tool result: {e}"),
        })
    }

    /// Tear down one connection. The entry is evicted first, so no new
    /// call can route to it while the transport closes.
    pub async fn disconnect(&self, server: &str) -> Result<(), RemoteError> {
        let entry = { self.connections.write().await.remove(server) };
        match entry {
            Some(entry) => {
                entry.transport.lock().await.close().await;
                info!(server, "Disconnected from remote tool server");
                Ok(())
            }
            None => Err(RemoteError::NotConnected(server.to_string())),
        }
    }

    /// Close every connection.
    pub async fn shutdown(&self) {
        let entries: Vec<(String, ServerEntry)> =
            { self.connections.write().await.drain().collect() };
        for (name, entry) in entries {
            debug!(server = %name, "Closing remote server connection");
            entry.transport.lock().await.close().await;
        }
    }

    /// Every cached tool across all connected servers, sorted by name.
    pub async fn cached_tools(&self) -> Vec<ToolDefinition> {
        let connections = self.connections.read().await;
        let mut tools: Vec<ToolDefinition> = connections
            .values()
            .flat_map(|entry| entry.tools.iter().cloned())
            .collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    /// Cached tools for one server.
    pub async fn cached_tools_for(&self, server: &str) -> Result<Vec<ToolDefinition>, RemoteError> {
        let connections = self.connections.read().await;
        connections
            .get(server)
            .map(|entry| entry.tools.clone())
            .ok_or_else(|| RemoteError::NotConnected(server.to_string()))
    }

    pub async fn connected_servers(&self) -> Vec<String> {
        let connections = self.connections.read().await;
        let mut names: Vec<String> = connections.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn is_connected(&self, server: &str) -> bool {
        self.connections.read().await.contains_key(server)
    }
}

/// Parse the `tools` array out of a `tools/list` result, skipping
/// entries that do not deserialize.
fn parse_tool_list(server: &str, result: &Value) -> Vec<McpToolInfo> {
    let Some(items) = result.get("tools").and_then(Value::as_array) else {
        warn!(server, "tools/list response carried no tools array");
        return Vec::new();
    };

    items
        .iter()
        .filter_map(|item| match serde_json::from_value::<McpToolInfo>(item.clone()) {
            Ok(info) => Some(info),
            Err(e) => {
                warn!(server, error = %e, "Skipping malformed tool entry");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use capstan_config::RemoteTransport;
    use serde_json::json;

    const INIT_RESPONSE: &str = r#"{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2024-11-05","capabilities":{"tools":{}},"serverInfo":{"name":"fixture","version":"0.0.1"}}}"#;

    fn write_script(dir: &tempfile::TempDir, body: &str) -> String {
        let path = dir.path().join("server.sh");
        std::fs::write(&path, body).unwrap();
        path.to_string_lossy().into_owned()
    }

    fn stdio_config(script_path: &str) -> RemoteServerConfig {
        RemoteServerConfig {
            transport: RemoteTransport::Stdio {
                command: "sh".into(),
                args: vec![script_path.to_string()],
                env: HashMap::new(),
            },
            timeout_ms: 2_000,
        }
    }

    /// Answers the handshake (ids 1 and 2), then a tool call (id 3)
    /// preceded by a stray notification. The tool list includes one
    /// malformed entry that must be skipped.
    fn echo_server_script() -> String {
        format!(
            concat!(
                "read line\n",
                "echo '{init}'\n",
                "read line\n",
                "read line\n",
                r#"echo '{{"jsonrpc":"2.0","id":2,"result":{{"tools":[{{"name":"echo","description":"Echoes input","inputSchema":{{"type":"object","properties":{{"text":{{"type":"string"}}}}}}}},{{"bogus":true}}]}}}}'"#,
                "\n",
                "read line\n",
                r#"echo '{{"jsonrpc":"2.0","method":"notifications/progress","params":{{"progress":50}}}}'"#,
                "\n",
                r#"echo '{{"jsonrpc":"2.0","id":3,"result":{{"content":[{{"type":"text","text":"echoed: hi"}}],"isError":false}}}}'"#,
                "\n",
            ),
            init = INIT_RESPONSE,
        )
    }

    #[tokio::test]
    async fn connect_discovers_namespaced_tools_and_execute_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(&dir, &echo_server_script());
        let manager = ConnectionManager::new();

        let tools = manager
            .connect("fixture", &stdio_config(&script))
            .await
            .unwrap();

        // The malformed entry is dropped; the real one is namespaced.
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "fixture__echo");
        assert_eq!(tools[0].timeout_ms, 2_000);
        assert!(matches!(
            &tools[0].environment,
            ToolEnvironment::Remote { server, remote_name }
                if server == "fixture" && remote_name == "echo"
        ));

        assert!(manager.is_connected("fixture").await);
        assert_eq!(manager.connected_servers().await, vec!["fixture"]);
        assert_eq!(manager.cached_tools().await.len(), 1);

        let result = manager
            .execute("fixture", "echo", &json!({"text": "hi"}))
            .await
            .unwrap();
        assert!(!result.is_error);
        assert_eq!(result.text(), "echoed: hi");
    }

    #[tokio::test]
    async fn error_results_keep_their_text() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(
            &dir,
            &format!(
                concat!(
                    "read line\n",
                    "echo '{init}'\n",
                    "read line\n",
                    "read line\n",
                    r#"echo '{{"jsonrpc":"2.0","id":2,"result":{{"tools":[{{"name":"search","inputSchema":{{"type":"object"}}}}]}}}}'"#,
                    "\n",
                    "read line\n",
                    r#"echo '{{"jsonrpc":"2.0","id":3,"result":{{"content":[{{"type":"text","text":"Network timeout"}}],"isError":true}}}}'"#,
                    "\n",
                ),
                init = INIT_RESPONSE,
            ),
        );
        let manager = ConnectionManager::new();
        manager.connect("api", &stdio_config(&script)).await.unwrap();

        let result = manager.execute("api", "search", &json!({})).await.unwrap();
        assert!(result.is_error);
        assert_eq!(result.text(), "Network timeout");
    }

    #[tokio::test]
    async fn rpc_errors_during_calls_propagate() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(
            &dir,
            &format!(
                concat!(
                    "read line\n",
                    "echo '{init}'\n",
                    "read line\n",
                    "read line\n",
                    r#"echo '{{"jsonrpc":"2.0","id":2,"result":{{"tools":[]}}}}'"#,
                    "\n",
                    "read line\n",
                    r#"echo '{{"jsonrpc":"2.0","id":3,"error":{{"code":-32602,"message":"Invalid params"}}}}'"#,
                    "\n",
                ),
                init = INIT_RESPONSE,
            ),
        );
        let manager = ConnectionManager::new();
        manager.connect("api", &stdio_config(&script)).await.unwrap();

        let err = manager.execute("api", "missing", &json!({})).await.unwrap_err();
        match err {
            RemoteError::Rpc { message, .. } => assert!(message.contains("Invalid params")),
            other => panic!("Expected Rpc, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn execute_on_unknown_server_fails_fast() {
        let manager = ConnectionManager::new();
        let err = manager
            .execute("nowhere", "anything", &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::NotConnected(name) if name == "nowhere"));
    }

    #[tokio::test]
    async fn connecting_under_an_existing_name_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(&dir, &echo_server_script());
        let manager = ConnectionManager::new();
        manager
            .connect("fixture", &stdio_config(&script))
            .await
            .unwrap();

        let err = manager
            .connect("fixture", &stdio_config(&script))
            .await
            .unwrap_err();
        match err {
            RemoteError::ConnectFailed { reason, .. } => {
                assert!(reason.contains("already connected"));
            }
            other => panic!("Expected ConnectFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn disconnect_evicts_and_later_calls_fail() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(&dir, &echo_server_script());
        let manager = ConnectionManager::new();
        manager
            .connect("fixture", &stdio_config(&script))
            .await
            .unwrap();

        manager.disconnect("fixture").await.unwrap();
        assert!(!manager.is_connected("fixture").await);
        assert!(manager.cached_tools().await.is_empty());

        let err = manager
            .execute("fixture", "echo", &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::NotConnected(_)));

        let err = manager.disconnect("fixture").await.unwrap_err();
        assert!(matches!(err, RemoteError::NotConnected(_)));
    }

    #[tokio::test]
    async fn failed_handshake_leaves_no_connection_behind() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(&dir, "exit 1\n");
        let manager = ConnectionManager::new();

        let err = manager
            .connect("broken", &stdio_config(&script))
            .await
            .unwrap_err();
        match err {
            RemoteError::ConnectFailed { reason, .. } => {
                assert!(reason.contains("initialize failed"), "reason was: {reason}");
            }
            other => panic!("Expected ConnectFailed, got {other:?}"),
        }
        assert!(!manager.is_connected("broken").await);
        assert!(manager.connected_servers().await.is_empty());
    }

    #[tokio::test]
    async fn shutdown_closes_everything() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(&dir, &echo_server_script());
        let manager = ConnectionManager::new();
        manager
            .connect("fixture", &stdio_config(&script))
            .await
            .unwrap();

        manager.shutdown().await;
        assert!(manager.connected_servers().await.is_empty());
    }
}
