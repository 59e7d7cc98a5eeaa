//! Transports for reaching MCP servers.
//!
//! Stdio spawns the server as a child process and speaks line-delimited
//! JSON-RPC on its pipes. Streamable HTTP POSTs each message and accepts
//! either a plain JSON body or an SSE stream whose `data:` frames carry
//! the response. Both match responses to requests and skip anything
//! interleaved (notifications, server-initiated traffic).

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use futures::StreamExt;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, trace, warn};

use capstan_config::RemoteTransport;
use capstan_core::error::RemoteError;

use crate::protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};

pub enum ServerTransport {
    Stdio(StdioTransport),
    Http(HttpTransport),
}

impl ServerTransport {
    /// Open a transport for `server` as described by its config. For
    /// stdio this spawns the child; for HTTP nothing leaves the machine
    /// until the first request.
    pub fn open(server: &str, transport: &RemoteTransport) -> Result<Self, RemoteError> {
        match transport {
            RemoteTransport::Stdio { command, args, env } => Ok(Self::Stdio(
                StdioTransport::spawn(server, command, args, env)?,
            )),
            RemoteTransport::Http { url, headers } => {
                Ok(Self::Http(HttpTransport::connect(server, url, headers)?))
            }
        }
    }

    /// Send a request and wait up to `timeout_ms` for its response.
    pub async fn request(
        &mut self,
        method: &str,
        params: Option<Value>,
        timeout_ms: u64,
    ) -> Result<Value, RemoteError> {
        match self {
            Self::Stdio(transport) => transport.request(method, params, timeout_ms).await,
            Self::Http(transport) => transport.request(method, params, timeout_ms).await,
        }
    }

    /// Send a one-way notification.
    pub async fn notify(&mut self, method: &str, timeout_ms: u64) -> Result<(), RemoteError> {
        match self {
            Self::Stdio(transport) => transport.notify(method).await,
            Self::Http(transport) => transport.notify(method, timeout_ms).await,
        }
    }

    pub async fn close(&mut self) {
        match self {
            Self::Stdio(transport) => transport.close().await,
            Self::Http(_) => {}
        }
    }
}

#[derive(Debug)]
pub struct StdioTransport {
    server: String,
    child: Child,
    stdin: ChildStdin,
    lines: Lines<BufReader<ChildStdout>>,
    next_id: u64,
}

impl StdioTransport {
    pub fn spawn(
        server: &str,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
    ) -> Result<Self, RemoteError> {
        let mut child = Command::new(command)
            .args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RemoteError::ConnectFailed {
                server: server.to_string(),
                reason: format!("failed to spawn '{command}': {e}"),
            })?;

        let stdin = child.stdin.take().ok_or_else(|| RemoteError::ConnectFailed {
            server: server.to_string(),
            reason: "child stdin unavailable".into(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| RemoteError::ConnectFailed {
            server: server.to_string(),
            reason: "child stdout unavailable".into(),
        })?;

        // Servers log to stderr; drain it so the pipe never fills.
        if let Some(stderr) = child.stderr.take() {
            let server = server.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(server = %server, line, "Remote server stderr");
                }
            });
        }

        Ok(Self {
            server: server.to_string(),
            child,
            stdin,
            lines: BufReader::new(stdout).lines(),
            next_id: 0,
        })
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    async fn write_line(&mut self, line: &str) -> Result<(), RemoteError> {
        let framed = format!("{line}\n");
        self.stdin
            .write_all(framed.as_bytes())
            .await
            .map_err(|e| RemoteError::Transport {
                server: self.server.clone(),
                reason: format!("stdin write failed: {e}"),
            })?;
        self.stdin.flush().await.map_err(|e| RemoteError::Transport {
            server: self.server.clone(),
            reason: format!("stdin flush failed: {e}"),
        })
    }

    pub async fn request(
        &mut self,
        method: &str,
        params: Option<Value>,
        timeout_ms: u64,
    ) -> Result<Value, RemoteError> {
        let id = self.next_id();
        let request = JsonRpcRequest::new(id, method, params);
        let encoded = serde_json::to_string(&request).map_err(|e| RemoteError::Transport {
            server: self.server.clone(),
            reason: format!("request encoding failed: {e}"),
        })?;

        trace!(server = %self.server, method, id, "Sending request");
        self.write_line(&encoded).await?;

        match tokio::time::timeout(Duration::from_millis(timeout_ms), self.read_matching(id)).await
        {
            Ok(outcome) => outcome,
            Err(_) => Err(RemoteError::Timeout {
                server: self.server.clone(),
                timeout_ms,
            }),
        }
    }

    pub async fn notify(&mut self, method: &str) -> Result<(), RemoteError> {
        let notification = JsonRpcNotification::new(method);
        let encoded =
            serde_json::to_string(&notification).map_err(|e| RemoteError::Transport {
                server: self.server.clone(),
                reason: format!("notification encoding failed: {e}"),
            })?;
        self.write_line(&encoded).await
    }

    /// Read lines until the response with `expected_id` arrives.
    /// Notifications and responses to other ids are skipped.
    async fn read_matching(&mut self, expected_id: u64) -> Result<Value, RemoteError> {
        loop {
            match self.lines.next_line().await {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<JsonRpcResponse>(line) {
                        Ok(response) => match response.id {
                            Some(id) if id == expected_id => {
                                return finish_response(&self.server, response);
                            }
                            Some(other) => {
                                debug!(
                                    server = %self.server,
                                    got = other,
                                    expected = expected_id,
                                    "Skipping response with mismatched id"
                                );
                            }
                            None => {
                                trace!(server = %self.server, line, "Skipping notification");
                            }
                        },
                        Err(e) => {
                            trace!(server = %self.server, line, error = %e, "Skipping non-response line");
                        }
                    }
                }
                Ok(None) => {
                    return Err(RemoteError::Transport {
                        server: self.server.clone(),
                        reason: "server closed the connection".into(),
                    });
                }
                Err(e) => {
                    return Err(RemoteError::Transport {
                        server: self.server.clone(),
                        reason: format!("stdout read failed: {e}"),
                    });
                }
            }
        }
    }

    pub async fn close(&mut self) {
        if let Err(e) = self.child.kill().await {
            debug!(server = %self.server, error = %e, "Remote server already gone");
        }
    }
}

pub struct HttpTransport {
    server: String,
    client: reqwest::Client,
    url: String,
    headers: HashMap<String, String>,
    next_id: u64,
}

impl HttpTransport {
    pub fn connect(
        server: &str,
        url: &str,
        headers: &HashMap<String, String>,
    ) -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| RemoteError::ConnectFailed {
                server: server.to_string(),
                reason: format!("failed to create HTTP client: {e}"),
            })?;

        Ok(Self {
            server: server.to_string(),
            client,
            url: url.to_string(),
            headers: headers.clone(),
            next_id: 0,
        })
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    pub async fn request(
        &mut self,
        method: &str,
        params: Option<Value>,
        timeout_ms: u64,
    ) -> Result<Value, RemoteError> {
        let id = self.next_id();
        let request = JsonRpcRequest::new(id, method, params);

        trace!(server = %self.server, method, id, "Sending request");
        match tokio::time::timeout(Duration::from_millis(timeout_ms), self.round_trip(&request))
            .await
        {
            Ok(outcome) => outcome,
            Err(_) => Err(RemoteError::Timeout {
                server: self.server.clone(),
                timeout_ms,
            }),
        }
    }

    pub async fn notify(&mut self, method: &str, timeout_ms: u64) -> Result<(), RemoteError> {
        let notification = JsonRpcNotification::new(method);
        let send = async {
            let mut http = self
                .client
                .post(&self.url)
                .header("Accept", "application/json, text/event-stream")
                .json(&notification);
            for (key, value) in &self.headers {
                http = http.header(key, value);
            }
            let response = http.send().await.map_err(|e| RemoteError::Transport {
                server: self.server.clone(),
                reason: format!("request failed: {e}"),
            })?;
            let status = response.status();
            if !status.is_success() {
                return Err(RemoteError::Transport {
                    server: self.server.clone(),
                    reason: format!("HTTP {status}"),
                });
            }
            Ok(())
        };

        match tokio::time::timeout(Duration::from_millis(timeout_ms), send).await {
            Ok(outcome) => outcome,
            Err(_) => Err(RemoteError::Timeout {
                server: self.server.clone(),
                timeout_ms,
            }),
        }
    }

    async fn round_trip(&self, request: &JsonRpcRequest) -> Result<Value, RemoteError> {
        let mut http = self
            .client
            .post(&self.url)
            .header("Accept", "application/json, text/event-stream")
            .json(request);
        for (key, value) in &self.headers {
            http = http.header(key, value);
        }

        let response = http.send().await.map_err(|e| RemoteError::Transport {
            server: self.server.clone(),
            reason: format!("request failed: {e}"),
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(RemoteError::Transport {
                server: self.server.clone(),
                reason: format!("HTTP {status}"),
            });
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("")
            .to_string();

        if content_type.starts_with("text/event-stream") {
            self.read_sse_response(response, request.id).await
        } else {
            let parsed: JsonRpcResponse =
                response.json().await.map_err(|e| RemoteError::Transport {
                    server: self.server.clone(),
                    reason: format!("unparseable response body: {e}"),
                })?;
            finish_response(&self.server, parsed)
        }
    }

    /// Streamable HTTP: the server answers with an SSE stream and the
    /// JSON-RPC response arrives as a `data:` frame.
    async fn read_sse_response(
        &self,
        response: reqwest::Response,
        expected_id: u64,
    ) -> Result<Value, RemoteError> {
        let mut stream = response.bytes_stream();
        let mut buffer = String::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| RemoteError::Transport {
                server: self.server.clone(),
                reason: format!("SSE read failed: {e}"),
            })?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(payload) = next_data_payload(&mut buffer) {
                if payload == "[DONE]" {
                    continue;
                }
                match serde_json::from_str::<JsonRpcResponse>(&payload) {
                    Ok(parsed) => match parsed.id {
                        Some(id) if id == expected_id => {
                            return finish_response(&self.server, parsed);
                        }
                        _ => {
                            trace!(server = %self.server, payload, "Skipping unrelated SSE frame");
                        }
                    },
                    Err(e) => {
                        warn!(server = %self.server, error = %e, "Skipping unparseable SSE frame");
                    }
                }
            }
        }

        Err(RemoteError::Transport {
            server: self.server.clone(),
            reason: "SSE stream ended without a response".into(),
        })
    }
}

/// Pull the next complete `data:` payload out of the SSE buffer.
/// Comments, event names, and blank separators are dropped; partial
/// lines stay buffered.
fn next_data_payload(buffer: &mut String) -> Option<String> {
    while let Some(pos) = buffer.find('\n') {
        let line = buffer[..pos].trim_end_matches('\r').trim().to_string();
        buffer.drain(..=pos);

        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        if let Some(payload) = line.strip_prefix("data:") {
            return Some(payload.trim().to_string());
        }
    }
    None
}

/// Turn a parsed response into its result value, mapping JSON-RPC
/// errors to transport errors.
fn finish_response(server: &str, response: JsonRpcResponse) -> Result<Value, RemoteError> {
    if let Some(error) = response.error {
        return Err(RemoteError::Rpc {
            server: server.to_string(),
            message: format!("{} (code {})", error.message, error.code),
        });
    }
    response.result.ok_or_else(|| RemoteError::Transport {
        server: server.to_string(),
        reason: "response carried no result".into(),
    })
}
