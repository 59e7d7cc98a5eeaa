//! Streaming chat client implementations for capstan.
//!
//! All clients implement the `capstan_core::ChatClient` trait. The
//! framing variant is selected once per conversation from the closed
//! [`ProviderKind`] set; adding a framing means adding a variant and a
//! match arm in [`build_client`].

pub mod marker;
pub mod openai_compat;

mod assemble;
mod wire;

pub use marker::MarkerChatClient;
pub use openai_compat::OpenAiCompatClient;

use std::sync::Arc;

use capstan_config::{ProviderConfig, ProviderKind};
use capstan_core::chat::ChatClient;
use capstan_core::error::ChatError;

/// Build the configured chat client.
pub fn build_client(config: &ProviderConfig) -> Result<Arc<dyn ChatClient>, ChatError> {
    let client: Arc<dyn ChatClient> = match config.kind {
        ProviderKind::OpenAiCompat => Arc::new(OpenAiCompatClient::new(
            &config.base_url,
            config.api_key.clone(),
            config.request_timeout_secs,
        )?),
        ProviderKind::Marker => Arc::new(MarkerChatClient::new(
            &config.base_url,
            config.api_key.clone(),
            config.request_timeout_secs,
        )?),
    };
    Ok(client)
}
