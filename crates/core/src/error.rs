//! Error types for the capstan domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error variant.

use thiserror::Error;

/// The top-level error type for all capstan operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Chat client errors ---
    #[error("Chat error: {0}")]
    Chat(#[from] ChatError),

    // --- Tool catalog errors ---
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    // --- Sandbox errors ---
    #[error("Sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    // --- Remote server errors ---
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    // --- Host channel errors ---
    #[error("Host error: {0}")]
    Host(#[from] HostError),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Cancellation ---
    #[error("Operation cancelled")]
    Cancelled,

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

#[derive(Debug, Clone, Error)]
pub enum ChatError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError { status_code: u16, message: String },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),
}

/// Failures in resolving a tool call against the catalog. These are fed
/// back to the model as failed results, never surfaced as process errors.
#[derive(Debug, Clone, Error)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Tool is disabled: {0}")]
    Disabled(String),

    #[error("Invalid arguments for {tool_name}: {reason}")]
    InvalidArguments { tool_name: String, reason: String },
}

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Failed to spawn sandbox runtime: {0}")]
    SpawnFailed(String),

    #[error("Tool timed out: {tool_name} after {timeout_ms}ms")]
    Timeout { tool_name: String, timeout_ms: u64 },

    #[error("Sandbox exited without a response for {tool_name}: {detail}")]
    ExitedWithoutResponse { tool_name: String, detail: String },

    #[error("Sandbox protocol error: {0}")]
    Protocol(String),

    #[error("Sandbox execution cancelled: {0}")]
    Cancelled(String),
}

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("Not connected to remote server: {0}")]
    NotConnected(String),

    #[error("Failed to connect to {server}: {reason}")]
    ConnectFailed { server: String, reason: String },

    #[error("Transport error on {server}: {reason}")]
    Transport { server: String, reason: String },

    #[error("Server {server} returned error: {message}")]
    Rpc { server: String, message: String },

    #[error("Remote call timed out on {server} after {timeout_ms}ms")]
    Timeout { server: String, timeout_ms: u64 },
}

#[derive(Debug, Clone, Error)]
pub enum HostError {
    #[error("No host attached to handle tool requests")]
    NotAttached,

    #[error("Host tool timed out: {tool_name} after {timeout_ms}ms")]
    Timeout { tool_name: String, timeout_ms: u64 },

    #[error("Host cancelled the tool request")]
    Cancelled,

    #[error("Host tool failed: {0}")]
    Failed(String),
}
