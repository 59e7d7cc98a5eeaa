//! Routes a resolved tool call to its execution environment.
//!
//! The router is the one place where heterogeneous failures (subprocess
//! exits, host-channel timeouts, remote-protocol errors) become a
//! uniform [`ToolExecutionResult`]. It never returns `Err`: a tool-level
//! failure is data the model reacts to, not an error the turn dies on.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use capstan_core::error::HostError;
use capstan_core::host::{HostBridge, HostEvent};
use capstan_core::tool::{ToolDefinition, ToolEnvironment, ToolExecutionResult};
use capstan_mcp::ConnectionManager;
use capstan_sandbox::SandboxedExecutor;

#[derive(Clone)]
pub struct ToolRouter {
    sandbox: Arc<SandboxedExecutor>,
    remote: Arc<ConnectionManager>,
    host: Arc<HostBridge>,
}

impl ToolRouter {
    pub fn new(
        sandbox: Arc<SandboxedExecutor>,
        remote: Arc<ConnectionManager>,
        host: Arc<HostBridge>,
    ) -> Self {
        Self {
            sandbox,
            remote,
            host,
        }
    }

    /// Execute one call whose arguments have already been validated.
    /// `call_id` doubles as the correlation id for host-environment
    /// tools.
    pub async fn dispatch(
        &self,
        definition: &ToolDefinition,
        call_id: &str,
        parameters: &Value,
        cancel: &CancellationToken,
    ) -> ToolExecutionResult {
        let env = match &definition.environment {
            ToolEnvironment::Local { .. } => "local",
            ToolEnvironment::Host => "host",
            ToolEnvironment::Remote { .. } => "remote",
        };
        debug!(tool = %definition.name, env, "Dispatching tool call");

        match &definition.environment {
            ToolEnvironment::Local { code } => {
                self.run_local(definition, code, parameters, cancel).await
            }
            ToolEnvironment::Host => self.run_host(definition, call_id, parameters, cancel).await,
            ToolEnvironment::Remote {
                server,
                remote_name,
            } => {
                self.run_remote(definition, server, remote_name, parameters, cancel)
                    .await
            }
        }
    }

    async fn run_local(
        &self,
        definition: &ToolDefinition,
        code: &str,
        parameters: &Value,
        cancel: &CancellationToken,
    ) -> ToolExecutionResult {
        let started = Instant::now();
        match self
            .sandbox
            .execute(&definition.name, code, parameters, definition.timeout_ms, cancel)
            .await
        {
            Ok(result) => result,
            Err(e) => {
                ToolExecutionResult::failed(e.to_string(), started.elapsed().as_millis() as u64)
            }
        }
    }

    /// Forward to the host channel and await the correlated result. The
    /// router owns the timeout; the host only resolves or declines.
    async fn run_host(
        &self,
        definition: &ToolDefinition,
        call_id: &str,
        parameters: &Value,
        cancel: &CancellationToken,
    ) -> ToolExecutionResult {
        let started = Instant::now();

        if !self.host.accepts_tool_requests() {
            return ToolExecutionResult::failed(HostError::NotAttached.to_string(), 0);
        }

        // Subscribe before notifying so a fast host cannot resolve into
        // a void. The slot evicts itself on every exit path.
        let mut slot = self.host.subscribe(call_id);
        self.host.notify(HostEvent::HostToolRequested {
            correlation_id: call_id.to_string(),
            tool_name: definition.name.clone(),
            parameters: parameters.clone(),
            timeout_ms: definition.timeout_ms,
        });

        let outcome = tokio::select! {
            _ = cancel.cancelled() => Err(HostError::Cancelled),
            waited = tokio::time::timeout(
                Duration::from_millis(definition.timeout_ms),
                slot.wait(),
            ) => match waited {
                Ok(resolved) => resolved,
                Err(_) => Err(HostError::Timeout {
                    tool_name: definition.name.clone(),
                    timeout_ms: definition.timeout_ms,
                }),
            },
        };

        let elapsed = started.elapsed().as_millis() as u64;
        match outcome {
            Ok(value) => ToolExecutionResult::ok(value, elapsed),
            Err(e) => ToolExecutionResult::failed(e.to_string(), elapsed),
        }
    }

    async fn run_remote(
        &self,
        definition: &ToolDefinition,
        server: &str,
        remote_name: &str,
        parameters: &Value,
        cancel: &CancellationToken,
    ) -> ToolExecutionResult {
        let started = Instant::now();

        let outcome = tokio::select! {
            _ = cancel.cancelled() => {
                return ToolExecutionResult::failed(
                    format!("Remote execution cancelled: {}", definition.name),
                    started.elapsed().as_millis() as u64,
                );
            }
            result = self.remote.execute(server, remote_name, parameters) => result,
        };

        let elapsed = started.elapsed().as_millis() as u64;
        match outcome {
            Ok(result) if result.is_error => ToolExecutionResult::failed(result.text(), elapsed),
            Ok(result) => ToolExecutionResult::ok(Value::String(result.text()), elapsed),
            Err(e) => ToolExecutionResult::failed(e.to_string(), elapsed),
        }
    }
}
