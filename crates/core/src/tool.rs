//! Tool catalog and call types.
//!
//! A tool here is a declaration, not an implementation: the catalog maps
//! names to definitions (schema, timeout, execution environment) and the
//! engine routes each call to the environment that can run it.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::chat::ToolSpec;
use crate::error::ToolError;

/// A tool call requested by the model.
///
/// During streaming the `arguments` buffer accumulates fragments and
/// `parameters` holds the latest successful parse as an advisory preview.
/// The buffer is never truncated mid-stream; whether the call is
/// dispatchable is decided once, from the final buffer state, via
/// [`ToolCallRequest::finalize_arguments`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRequest {
    /// Unique call ID (the provider's id, or synthesized when absent)
    pub id: String,

    /// Name of the tool to execute
    pub name: String,

    /// Raw argument text as streamed, concatenated in arrival order
    #[serde(default)]
    pub arguments: String,

    /// Parsed arguments, once the buffer forms valid JSON
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<serde_json::Value>,
}

impl ToolCallRequest {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments: String::new(),
            parameters: None,
        }
    }

    /// Build an already-parsed request (marker-framed providers and tests).
    pub fn parsed(name: impl Into<String>, parameters: serde_json::Value) -> Self {
        let arguments =
            serde_json::to_string(&parameters).unwrap_or_else(|_| String::from("{}"));
        Self {
            id: format!("call_{}", Uuid::new_v4().simple()),
            name: name.into(),
            arguments,
            parameters: Some(parameters),
        }
    }

    /// Append a streamed fragment and refresh the advisory parse.
    ///
    /// A parse failure is not an error: argument JSON routinely splits
    /// across fragments at arbitrary byte boundaries.
    pub fn append_arguments(&mut self, fragment: &str) {
        self.arguments.push_str(fragment);
        if let Ok(value) = serde_json::from_str(&self.arguments) {
            self.parameters = Some(value);
        }
    }

    /// Decide dispatchability from the final buffer state.
    ///
    /// An empty buffer means a no-parameter call and parses as `{}`.
    /// Returns false when the buffer is non-empty and still not valid
    /// JSON; callers drop such calls rather than executing them.
    pub fn finalize_arguments(&mut self) -> bool {
        if self.arguments.trim().is_empty() {
            self.parameters = Some(serde_json::Value::Object(serde_json::Map::new()));
            return true;
        }
        match serde_json::from_str(&self.arguments) {
            Ok(value) => {
                self.parameters = Some(value);
                true
            }
            Err(_) => {
                self.parameters = None;
                false
            }
        }
    }
}

/// Where a tool executes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ToolEnvironment {
    /// Code run in a disposable sandboxed subprocess.
    Local { code: String },
    /// Delegated to the attached host application.
    Host,
    /// Forwarded to a connected remote tool server.
    Remote { server: String, remote_name: String },
}

/// A registered tool: everything the engine needs to advertise it to the
/// model and route its calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,

    pub description: String,

    /// JSON Schema for the call arguments
    pub parameters_schema: serde_json::Value,

    /// JSON Schema for the result, when declared
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub returns_schema: Option<serde_json::Value>,

    /// Per-call execution budget
    pub timeout_ms: u64,

    /// Disabled tools stay registered but are neither advertised nor
    /// executable
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    pub environment: ToolEnvironment,
}

fn default_enabled() -> bool {
    true
}

impl ToolDefinition {
    /// The lean model-facing shape of this definition.
    pub fn to_spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.parameters_schema.clone(),
        }
    }
}

/// The set of tools available to a conversation.
///
/// The engine snapshots `specs()` once per turn; registrations during a
/// turn become visible on the next one.
#[derive(Debug, Clone, Default)]
pub struct ToolCatalog {
    tools: HashMap<String, ToolDefinition>,
}

impl ToolCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Replaces any existing tool with the same name.
    pub fn register(&mut self, definition: ToolDefinition) {
        self.tools.insert(definition.name.clone(), definition);
    }

    /// Look up a tool for execution. Disabled tools resolve as errors so
    /// the failure is fed back to the model like any other tool failure.
    pub fn resolve(&self, name: &str) -> std::result::Result<&ToolDefinition, ToolError> {
        let def = self
            .tools
            .get(name)
            .ok_or_else(|| ToolError::NotFound(name.to_string()))?;
        if !def.enabled {
            return Err(ToolError::Disabled(name.to_string()));
        }
        Ok(def)
    }

    /// Model-facing specs for every enabled tool, sorted by name so the
    /// advertised list is stable across turns.
    pub fn specs(&self) -> Vec<ToolSpec> {
        let mut specs: Vec<ToolSpec> = self
            .tools
            .values()
            .filter(|d| d.enabled)
            .map(ToolDefinition::to_spec)
            .collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    /// All registered tool names, enabled or not.
    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(|s| s.as_str()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ToolDefinition> {
        self.tools.values()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

/// The outcome of one tool execution, success or failure.
///
/// Every failure shape (sandbox crash, timeout, unknown tool, schema
/// rejection, remote error) normalizes into this type so the model always
/// sees a uniform result entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolExecutionResult {
    pub success: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub execution_time_ms: u64,
}

impl ToolExecutionResult {
    pub fn ok(result: serde_json::Value, execution_time_ms: u64) -> Self {
        Self {
            success: true,
            result: Some(result),
            error: None,
            execution_time_ms,
        }
    }

    pub fn failed(error: impl Into<String>, execution_time_ms: u64) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error.into()),
            execution_time_ms,
        }
    }

    /// Render this result as the text the model reads back.
    ///
    /// Successful calls include the compact JSON result and the execution
    /// time; failed calls carry the error message. Models are sensitive to
    /// this phrasing, so it stays fixed.
    pub fn to_model_text(&self, tool_name: &str) -> String {
        if self.success {
            let json = self
                .result
                .as_ref()
                .map(|v| serde_json::to_string(v).unwrap_or_else(|_| String::from("null")))
                .unwrap_or_else(|| String::from("null"));
            format!(
                "Tool \"{}\" executed successfully:\n{}\n(Execution time: {}ms)",
                tool_name, json, self.execution_time_ms
            )
        } else {
            format!(
                "Tool \"{}\" failed: {}",
                tool_name,
                self.error.as_deref().unwrap_or("unknown error")
            )
        }
    }
}
