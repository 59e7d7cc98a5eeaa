//! End-to-end integration tests for the capstan engine.
//!
//! These tests exercise the full pipeline from user message to final
//! answer: catalog assembly, model round-trips, sandbox execution over
//! real short-lived subprocesses, and conversation history shape.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use capstan_config::{AppConfig, ToolConfig};
use capstan_core::chat::{ChatClient, ChatRequest, ChatTurn, StreamEvent};
use capstan_core::error::{ChatError, Error};
use capstan_core::host::NullHostChannel;
use capstan_core::message::{Conversation, Role};
use capstan_core::tool::ToolCallRequest;
use capstan_engine::Engine;
use capstan_mcp::ConnectionManager;
use capstan_sandbox::SandboxedExecutor;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

// ── Scripted model client ────────────────────────────────────────────────

/// Replays pre-scripted event streams, one per model round.
struct ScriptedClient {
    rounds: Mutex<VecDeque<Vec<Result<StreamEvent, ChatError>>>>,
}

impl ScriptedClient {
    fn new(rounds: Vec<Vec<Result<StreamEvent, ChatError>>>) -> Arc<Self> {
        Arc::new(Self {
            rounds: Mutex::new(rounds.into()),
        })
    }

    fn remaining(&self) -> usize {
        self.rounds.lock().unwrap().len()
    }
}

#[async_trait::async_trait]
impl ChatClient for ScriptedClient {
    fn name(&self) -> &str {
        "e2e_scripted"
    }

    async fn stream(
        &self,
        _request: ChatRequest,
    ) -> Result<mpsc::Receiver<Result<StreamEvent, ChatError>>, ChatError> {
        let round = self
            .rounds
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| ChatError::NotConfigured("script exhausted".into()))?;
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            for event in round {
                if tx.send(event).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }
}

fn completed(text: &str, calls: Vec<ToolCallRequest>) -> Result<StreamEvent, ChatError> {
    Ok(StreamEvent::Completed(ChatTurn {
        text: text.into(),
        reasoning: None,
        tool_calls: calls,
    }))
}

// ── Engine assembly helpers ──────────────────────────────────────────────

/// A sandbox script that answers every request with a fixed weather
/// reading, exercising the real subprocess line protocol.
const WEATHER_SANDBOX: &str =
    r#"read line; printf '%s\n' '{"success":true,"result":{"temperature":72},"execution_time_ms":100}'"#;

fn scripted_engine(
    rounds: Vec<Vec<Result<StreamEvent, ChatError>>>,
    sandbox_script: &str,
    config: AppConfig,
) -> (Engine, Arc<ScriptedClient>) {
    let client = ScriptedClient::new(rounds);
    let engine = Engine::new(
        client.clone(),
        Arc::new(SandboxedExecutor::command(
            "sh",
            vec!["-c".into(), sandbox_script.into()],
        )),
        Arc::new(ConnectionManager::new()),
        Arc::new(NullHostChannel),
        config,
    );
    (engine, client)
}

fn config_with_tool(name: &str, parameters: serde_json::Value) -> AppConfig {
    let mut config = AppConfig::default();
    config.tools.push(ToolConfig {
        name: name.into(),
        description: "Test tool".into(),
        parameters,
        returns: None,
        timeout_ms: Some(5_000),
        enabled: true,
        environment: "local".into(),
        code: Some("return {};".into()),
        server: None,
        remote_name: None,
    });
    config
}

// ── E2E: Tool round trip ─────────────────────────────────────────────────

#[tokio::test]
async fn e2e_single_tool_turn_round_trip() {
    // Scenario: user asks for the weather, the model calls get_weather,
    // reads the result, and answers.
    let (engine, client) = scripted_engine(
        vec![
            vec![completed(
                "",
                vec![ToolCallRequest::parsed(
                    "get_weather",
                    serde_json::json!({"location": "San Francisco"}),
                )],
            )],
            vec![completed(
                "The weather in San Francisco is 72 degrees.",
                vec![],
            )],
        ],
        WEATHER_SANDBOX,
        config_with_tool(
            "get_weather",
            serde_json::json!({
                "type": "object",
                "properties": {"location": {"type": "string"}},
                "required": ["location"]
            }),
        ),
    );

    let mut conversation = Conversation::new();
    let reply = engine
        .run_turn(
            &mut conversation,
            "What's the weather in San Francisco?",
            &CancellationToken::new(),
        )
        .await
        .expect("Turn should succeed");

    assert_eq!(reply, "The weather in San Francisco is 72 degrees.");

    // user, assistant call entry, tool result, final answer
    assert_eq!(conversation.messages.len(), 4);
    assert_eq!(conversation.messages[0].role, Role::User);
    assert_eq!(conversation.messages[1].role, Role::Assistant);
    assert_eq!(conversation.messages[1].tool_calls.len(), 1);
    assert_eq!(conversation.messages[2].role, Role::Tool);
    assert_eq!(
        conversation.messages[2].content,
        "Tool \"get_weather\" executed successfully:\n{\"temperature\":72}\n(Execution time: 100ms)"
    );
    assert_eq!(conversation.messages[3].role, Role::Assistant);
    assert_eq!(client.remaining(), 0);
}

#[tokio::test]
async fn e2e_failed_tool_surfaces_error_to_model() {
    let script =
        r#"read line; printf '%s\n' '{"success":false,"error":"Network timeout","execution_time_ms":5}'"#;
    let (engine, _client) = scripted_engine(
        vec![
            vec![completed(
                "",
                vec![ToolCallRequest::parsed(
                    "search",
                    serde_json::json!({"query": "rust"}),
                )],
            )],
            vec![completed("The search backend is unreachable.", vec![])],
        ],
        script,
        config_with_tool("search", serde_json::json!({"type": "object"})),
    );

    let mut conversation = Conversation::new();
    let reply = engine
        .run_turn(
            &mut conversation,
            "find rust docs",
            &CancellationToken::new(),
        )
        .await
        .expect("Turn should still succeed");

    // The failure is reported to the model, not raised as an engine error.
    assert_eq!(reply, "The search backend is unreachable.");
    assert_eq!(
        conversation.messages[2].content,
        "Tool \"search\" failed: Network timeout"
    );
}

#[tokio::test]
async fn e2e_duplicate_tool_calls_execute_once() {
    let (engine, _client) = scripted_engine(
        vec![
            vec![completed(
                "",
                vec![
                    ToolCallRequest::parsed(
                        "get_weather",
                        serde_json::json!({"location": "Paris"}),
                    ),
                    ToolCallRequest::parsed(
                        "get_weather",
                        serde_json::json!({"location": "Paris"}),
                    ),
                ],
            )],
            vec![completed("Paris is 72 degrees.", vec![])],
        ],
        WEATHER_SANDBOX,
        config_with_tool("get_weather", serde_json::json!({"type": "object"})),
    );

    let mut conversation = Conversation::new();
    engine
        .run_turn(
            &mut conversation,
            "Paris weather, twice",
            &CancellationToken::new(),
        )
        .await
        .expect("Turn should succeed");

    // One executed call: user + call entry + result + final answer.
    assert_eq!(conversation.messages.len(), 4);
}

// ── E2E: Loop bounds ─────────────────────────────────────────────────────

#[tokio::test]
async fn e2e_iteration_cap_truncates_with_notice() {
    let mut config = config_with_tool("probe", serde_json::json!({"type": "object"}));
    config.engine.max_iterations = 2;

    let probe_round = |n: u32| {
        vec![completed(
            &format!("round {n}"),
            vec![ToolCallRequest::parsed(
                "probe",
                serde_json::json!({"round": n}),
            )],
        )]
    };
    let (engine, client) = scripted_engine(
        vec![probe_round(1), probe_round(2)],
        WEATHER_SANDBOX,
        config,
    );

    let mut conversation = Conversation::new();
    let reply = engine
        .run_turn(&mut conversation, "keep probing", &CancellationToken::new())
        .await
        .expect("Turn should complete despite the cap");

    assert_eq!(
        reply,
        "round 2\n\n[Stopped after 2 tool-call rounds: iteration limit reached]"
    );
    let last = conversation.messages.last().expect("history is non-empty");
    assert_eq!(last.role, Role::Assistant);
    assert!(last.tool_calls.is_empty());
    // No third model request went out.
    assert_eq!(client.remaining(), 0);
}

// ── E2E: Catalog gating ──────────────────────────────────────────────────

#[tokio::test]
async fn e2e_disabled_tool_is_not_advertised_and_rejected() {
    let mut config = config_with_tool("get_weather", serde_json::json!({"type": "object"}));
    config.tools[0].enabled = false;

    let (engine, _client) = scripted_engine(
        vec![
            vec![completed(
                "",
                vec![ToolCallRequest::parsed(
                    "get_weather",
                    serde_json::json!({"location": "SF"}),
                )],
            )],
            vec![completed("I cannot check the weather right now.", vec![])],
        ],
        WEATHER_SANDBOX,
        config,
    );

    // Not advertised to the model.
    let catalog = engine.catalog().await.expect("catalog builds");
    assert!(catalog.specs().is_empty());

    // A call to it anyway comes back as a failed result.
    let mut conversation = Conversation::new();
    engine
        .run_turn(&mut conversation, "weather?", &CancellationToken::new())
        .await
        .expect("Turn should succeed");

    assert_eq!(
        conversation.messages[2].content,
        "Tool \"get_weather\" failed: Tool is disabled: get_weather"
    );
}

#[tokio::test]
async fn e2e_schema_validation_blocks_bad_arguments() {
    let (engine, _client) = scripted_engine(
        vec![
            vec![completed(
                "",
                vec![ToolCallRequest::parsed("get_weather", serde_json::json!({}))],
            )],
            vec![completed("I need a location to check the weather.", vec![])],
        ],
        // A sandbox that would hang if the rejected call reached it.
        "sleep 30",
        config_with_tool(
            "get_weather",
            serde_json::json!({
                "type": "object",
                "properties": {"location": {"type": "string"}},
                "required": ["location"]
            }),
        ),
    );

    let mut conversation = Conversation::new();
    let reply = tokio::time::timeout(
        std::time::Duration::from_secs(2),
        engine.run_turn(&mut conversation, "weather?", &CancellationToken::new()),
    )
    .await
    .expect("validation must not reach the sandbox")
    .expect("Turn should succeed");

    assert_eq!(reply, "I need a location to check the weather.");
    assert!(
        conversation.messages[2]
            .content
            .contains("missing required property: location")
    );
}

// ── E2E: System prompt and context files ─────────────────────────────────

#[tokio::test]
async fn e2e_context_files_flow_into_system_message() {
    let dir = tempfile::tempdir().expect("tempdir");
    let notes = dir.path().join("notes.md");
    std::fs::write(&notes, "Alpha launches Tuesday.\n").expect("write context file");

    let mut config = AppConfig::default();
    config.engine.system_prompt = Some("You are terse.".into());
    config.engine.context_files = vec![notes.display().to_string()];

    let (engine, _client) = scripted_engine(
        vec![vec![completed("Understood.", vec![])]],
        WEATHER_SANDBOX,
        config,
    );

    let mut conversation = Conversation::new();
    engine
        .run_turn(&mut conversation, "hello", &CancellationToken::new())
        .await
        .expect("Turn should succeed");

    assert_eq!(conversation.messages[0].role, Role::System);
    let system = &conversation.messages[0].content;
    assert!(system.starts_with("You are terse."));
    assert!(system.contains("## Context:"));
    assert!(system.contains("Alpha launches Tuesday."));
}

// ── E2E: Cancellation ────────────────────────────────────────────────────

#[tokio::test]
async fn e2e_cancelled_turn_reports_cancellation() {
    let (engine, _client) = scripted_engine(
        vec![vec![completed("never delivered", vec![])]],
        WEATHER_SANDBOX,
        AppConfig::default(),
    );

    let cancel = CancellationToken::new();
    cancel.cancel();

    let mut conversation = Conversation::new();
    let err = engine
        .run_turn(&mut conversation, "hello", &cancel)
        .await
        .expect_err("cancelled turn must not succeed");

    assert!(matches!(err, Error::Cancelled));
    // Only the user message was recorded; no fabricated assistant entry.
    assert_eq!(conversation.messages.len(), 1);
    assert_eq!(conversation.messages[0].role, Role::User);
}
