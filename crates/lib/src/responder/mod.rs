//! Automated responder capability and its LLM-backed clients.
//!
//! The router hands the user's text to a [`Responder`] when no agent owns the
//! conversation. Failures are recovered by the router with a fixed apology.

mod ollama;
mod openai;

pub use ollama::OllamaResponder;
pub use openai::OpenAiResponder;

use crate::config::{self, Config, ResponderBackend};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum ResponderError {
    #[error("responder request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("responder api error: {0}")]
    Api(String),
    #[error("responder returned an empty reply")]
    Empty,
}

#[async_trait]
pub trait Responder: Send + Sync {
    /// Produce a reply to the user's text.
    async fn complete(&self, text: &str) -> Result<String, ResponderError>;
}

/// Build the configured responder backend.
pub fn from_config(config: &Config) -> Arc<dyn Responder> {
    let r = &config.responder;
    match r.backend {
        ResponderBackend::Ollama => {
            let client = OllamaResponder::new(r.base_url.clone(), r.model.clone(), r.system_prompt.clone());
            log::info!("responder: ollama, model {}", client.model());
            Arc::new(client)
        }
        ResponderBackend::OpenAi => {
            let client = OpenAiResponder::new(
                r.base_url.clone(),
                r.model.clone(),
                config::resolve_api_key(config),
                r.system_prompt.clone(),
            );
            log::info!("responder: openai-compatible, model {}", client.model());
            Arc::new(client)
        }
    }
}

/// One chat message in the request body (shared by both backends).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: String,
}

/// System prompt (when set) followed by the user's text.
pub(crate) fn build_messages(system_prompt: Option<&str>, text: &str) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(2);
    if let Some(prompt) = system_prompt.map(str::trim).filter(|p| !p.is_empty()) {
        messages.push(ChatMessage {
            role: "system".to_string(),
            content: prompt.to_string(),
        });
    }
    messages.push(ChatMessage {
        role: "user".to_string(),
        content: text.to_string(),
    });
    messages
}

/// Trimmed reply, or `Empty` when the model said nothing.
pub(crate) fn non_empty(reply: &str) -> Result<String, ResponderError> {
    let trimmed = reply.trim();
    if trimmed.is_empty() {
        Err(ResponderError::Empty)
    } else {
        Ok(trimmed.to_string())
    }
}
