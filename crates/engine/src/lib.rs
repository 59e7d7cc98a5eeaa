//! # Capstan Engine
//!
//! Wires the provider client, sandbox, remote connections, and host
//! bridge into a turn loop. [`Engine`] is the embedding surface: build
//! one from an [`AppConfig`], connect remote servers, then feed it user
//! messages. [`TurnRunner`] and [`ToolRouter`] remain public for
//! embedders that assemble the parts themselves.

pub mod router;
pub mod runner;

pub use router::ToolRouter;
pub use runner::TurnRunner;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use capstan_config::{AppConfig, SandboxConfig};
use capstan_core::chat::ChatClient;
use capstan_core::error::{Error, Result};
use capstan_core::host::{HostBridge, HostChannel};
use capstan_core::message::{Conversation, Message};
use capstan_core::tool::ToolCatalog;
use capstan_mcp::ConnectionManager;
use capstan_providers::build_client;
use capstan_sandbox::{SandboxPolicy, SandboxedExecutor};

/// One configured engine instance.
///
/// Shared collaborators live behind [`Arc`]s; the engine itself can be
/// cloned cheaply via [`Arc`] if an embedder needs to run turns from
/// several tasks.
pub struct Engine {
    client: Arc<dyn ChatClient>,
    sandbox: Arc<SandboxedExecutor>,
    remote: Arc<ConnectionManager>,
    host: Arc<HostBridge>,
    config: AppConfig,
    context_blocks: Vec<String>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("context_blocks", &self.context_blocks)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Build an engine from configuration. `channel` receives turn events
    /// and may serve host-environment tools.
    pub fn from_config(config: AppConfig, channel: Arc<dyn HostChannel>) -> Result<Self> {
        let client = build_client(&config.provider)?;
        let sandbox = Arc::new(build_sandbox(&config.sandbox)?);
        let context_blocks = load_context_blocks(&config.engine.context_files);
        Ok(Self {
            client,
            sandbox,
            remote: Arc::new(ConnectionManager::new()),
            host: Arc::new(HostBridge::new(channel)),
            config,
            context_blocks,
        })
    }

    /// Assemble an engine from pre-built parts. Embedders and tests use
    /// this to swap in their own client or sandbox.
    pub fn new(
        client: Arc<dyn ChatClient>,
        sandbox: Arc<SandboxedExecutor>,
        remote: Arc<ConnectionManager>,
        channel: Arc<dyn HostChannel>,
        config: AppConfig,
    ) -> Self {
        let context_blocks = load_context_blocks(&config.engine.context_files);
        Self {
            client,
            sandbox,
            remote,
            host: Arc::new(HostBridge::new(channel)),
            config,
            context_blocks,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn remote(&self) -> Arc<ConnectionManager> {
        Arc::clone(&self.remote)
    }

    /// The bridge hosts resolve host-environment tool results through.
    pub fn host(&self) -> Arc<HostBridge> {
        Arc::clone(&self.host)
    }

    /// Connect every configured remote server, skipping the ones that
    /// fail. Returns how many connected.
    pub async fn connect_remote_servers(&self) -> usize {
        let mut connected = 0;
        for (name, server) in &self.config.remote_servers {
            match self.remote.connect(name, server).await {
                Ok(tools) => {
                    info!(server = %name, tools = tools.len(), "Connected to remote server");
                    connected += 1;
                }
                Err(e) => {
                    warn!(server = %name, "Skipping remote server: {e}");
                }
            }
        }
        connected
    }

    /// The current tool catalog: configured tools plus the cached tool
    /// lists of every connected remote server.
    pub async fn catalog(&self) -> Result<ToolCatalog> {
        let mut catalog = ToolCatalog::new();
        let configured = self
            .config
            .tool_definitions()
            .map_err(|e| Error::Config {
                message: e.to_string(),
            })?;
        for definition in configured {
            catalog.register(definition);
        }
        for definition in self.remote.cached_tools().await {
            catalog.register(definition);
        }
        Ok(catalog)
    }

    /// Run one user turn: push the user message, then drive the model and
    /// its tool calls to completion. Returns the final answer text.
    pub async fn run_turn(
        &self,
        conversation: &mut Conversation,
        user_message: impl Into<String>,
        cancel: &CancellationToken,
    ) -> Result<String> {
        conversation.push(Message::user(user_message));
        let catalog = self.catalog().await?;
        self.runner().run(conversation, &catalog, cancel).await
    }

    /// Close all remote connections.
    pub async fn shutdown(&self) {
        self.remote.shutdown().await;
    }

    fn runner(&self) -> TurnRunner {
        let router = ToolRouter::new(
            Arc::clone(&self.sandbox),
            Arc::clone(&self.remote),
            Arc::clone(&self.host),
        );
        let provider = &self.config.provider;
        let engine = &self.config.engine;
        let mut runner = TurnRunner::new(
            Arc::clone(&self.client),
            router,
            Arc::clone(&self.host),
            provider.model.clone(),
        )
        .with_temperature(provider.temperature)
        .with_max_tokens(provider.max_tokens)
        .with_max_iterations(engine.max_iterations)
        .with_context_blocks(self.context_blocks.clone());
        if let Some(top_p) = provider.top_p {
            runner = runner.with_top_p(top_p);
        }
        if let Some(prompt) = &engine.system_prompt {
            runner = runner.with_system_prompt(prompt.clone());
        }
        runner
    }
}

fn build_sandbox(config: &SandboxConfig) -> Result<SandboxedExecutor> {
    let executor = match config.runtime.as_str() {
        "command" => {
            let program = config.command.clone().ok_or_else(|| Error::Config {
                message: "sandbox.runtime = \"command\" requires sandbox.command".into(),
            })?;
            SandboxedExecutor::command(program, config.args.clone())
        }
        _ => SandboxedExecutor::node(),
    };
    Ok(executor.with_policy(SandboxPolicy {
        inherit_env: config.inherit_env,
        ..SandboxPolicy::default()
    }))
}

/// Read the configured context files into system-prompt sections.
/// Unreadable files are skipped with a warning rather than failing the
/// whole engine.
fn load_context_blocks(paths: &[String]) -> Vec<String> {
    let mut blocks = Vec::new();
    for path in paths {
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let trimmed = content.trim_end();
                if trimmed.is_empty() {
                    continue;
                }
                blocks.push(format!("## Context: {path}\n\n{trimmed}"));
            }
            Err(e) => {
                warn!(path = %path, "Skipping unreadable context file: {e}");
            }
        }
    }
    blocks
}

#[cfg(test)]
mod tests {
    use super::*;

    use capstan_config::ToolConfig;
    use capstan_core::chat::{ChatRequest, ChatTurn, StreamEvent};
    use capstan_core::error::ChatError;
    use capstan_core::host::NullHostChannel;
    use capstan_core::message::Role;
    use capstan_core::tool::ToolEnvironment;
    use serde_json::json;
    use tokio::sync::mpsc;

    /// Completes every round with the same fixed text and no tool calls.
    struct StaticClient {
        text: String,
    }

    #[async_trait::async_trait]
    impl ChatClient for StaticClient {
        fn name(&self) -> &str {
            "static"
        }

        async fn stream(
            &self,
            _request: ChatRequest,
        ) -> std::result::Result<
            mpsc::Receiver<std::result::Result<StreamEvent, ChatError>>,
            ChatError,
        > {
            let (tx, rx) = mpsc::channel(4);
            let turn = ChatTurn {
                text: self.text.clone(),
                reasoning: None,
                tool_calls: vec![],
            };
            tokio::spawn(async move {
                let _ = tx.send(Ok(StreamEvent::Completed(turn))).await;
            });
            Ok(rx)
        }
    }

    fn test_engine(config: AppConfig) -> Engine {
        Engine::new(
            Arc::new(StaticClient {
                text: "hi there".into(),
            }),
            Arc::new(SandboxedExecutor::command(
                "sh",
                vec!["-c".into(), "read line".into()],
            )),
            Arc::new(ConnectionManager::new()),
            Arc::new(NullHostChannel),
            config,
        )
    }

    #[tokio::test]
    async fn catalog_holds_configured_tools() {
        let mut config = AppConfig::default();
        config.tools.push(ToolConfig {
            name: "echo".into(),
            description: "Echo the input".into(),
            parameters: json!({"type": "object"}),
            returns: None,
            timeout_ms: None,
            enabled: true,
            environment: "local".into(),
            code: Some("return parameters;".into()),
            server: None,
            remote_name: None,
        });
        let default_timeout = config.sandbox.default_timeout_ms;
        let engine = test_engine(config);

        let catalog = engine.catalog().await.unwrap();
        assert_eq!(catalog.len(), 1);
        let echo = catalog.resolve("echo").unwrap();
        assert_eq!(echo.timeout_ms, default_timeout);
        assert!(matches!(echo.environment, ToolEnvironment::Local { .. }));
    }

    #[tokio::test]
    async fn run_turn_appends_user_and_assistant_entries() {
        let engine = test_engine(AppConfig::default());
        let mut conversation = Conversation::new();

        let reply = engine
            .run_turn(&mut conversation, "hello", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(reply, "hi there");
        assert_eq!(conversation.messages.len(), 2);
        assert_eq!(conversation.messages[0].role, Role::User);
        assert_eq!(conversation.messages[0].content, "hello");
        assert_eq!(conversation.messages[1].role, Role::Assistant);
    }

    #[tokio::test]
    async fn command_runtime_without_command_is_rejected() {
        let mut config = AppConfig::default();
        config.sandbox.runtime = "command".into();
        config.sandbox.command = None;

        let err = Engine::from_config(config, Arc::new(NullHostChannel)).unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }
}
