//! # Capstan Core
//!
//! Domain types, traits, and error definitions for the capstan
//! tool-calling engine. This crate has **zero framework dependencies** —
//! it defines the domain model that all other crates implement against.
//!
//! ## Design Philosophy
//!
//! Every subsystem is defined as a trait here. Implementations live in
//! their respective crates. This enables:
//! - Swapping implementations via configuration
//! - Easy testing with mock/stub implementations
//! - Clean dependency graph (all crates depend inward on core)

pub mod chat;
pub mod error;
pub mod host;
pub mod message;
pub mod schema;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use chat::{ChatClient, ChatRequest, ChatTurn, StreamEvent, ToolSpec};
pub use error::{
    ChatError, Error, HostError, RemoteError, Result, SandboxError, ToolError,
};
pub use host::{HostBridge, HostChannel, HostEvent, HostResultSlot, NullHostChannel};
pub use message::{Conversation, ConversationId, Message, Role};
pub use schema::SchemaValidator;
pub use tool::{
    ToolCallRequest, ToolCatalog, ToolDefinition, ToolEnvironment, ToolExecutionResult,
};
