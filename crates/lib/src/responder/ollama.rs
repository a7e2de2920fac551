//! Ollama responder (http://127.0.0.1:11434 by default), non-streaming /api/chat.

use crate::responder::{build_messages, non_empty, ChatMessage, Responder, ResponderError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

const DEFAULT_BASE_URL: &str = "http://127.0.0.1:11434";
pub(crate) const DEFAULT_MODEL: &str = "llama3.2:latest";

/// Client for the Ollama HTTP API.
#[derive(Clone)]
pub struct OllamaResponder {
    base_url: String,
    model: String,
    system_prompt: Option<String>,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    message: Option<ChatMessage>,
}

impl OllamaResponder {
    pub fn new(base_url: Option<String>, model: Option<String>, system_prompt: Option<String>) -> Self {
        let base_url = base_url
            .map(|u| u.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let model = model
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());
        Self {
            base_url,
            model,
            system_prompt,
            client: reqwest::Client::new(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl Responder for OllamaResponder {
    /// POST /api/chat with stream: false.
    async fn complete(&self, text: &str) -> Result<String, ResponderError> {
        let url = format!("{}/api/chat", self.base_url);
        let body = ChatRequest {
            model: &self.model,
            messages: build_messages(self.system_prompt.as_deref(), text),
            stream: false,
        };
        log::debug!("ollama: chat with model {}", self.model);
        let res = self.client.post(&url).json(&body).send().await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(ResponderError::Api(format!("{} {}", status, body)));
        }
        let data: ChatResponse = res.json().await?;
        non_empty(data.message.as_ref().map(|m| m.content.as_str()).unwrap_or(""))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_for_missing_or_blank_values() {
        let r = OllamaResponder::new(None, Some("  ".into()), None);
        assert_eq!(r.model(), DEFAULT_MODEL);
        assert_eq!(r.base_url, DEFAULT_BASE_URL);
        let r = OllamaResponder::new(Some("http://gpu:11434/".into()), Some("qwen3:8b".into()), None);
        assert_eq!(r.base_url, "http://gpu:11434");
        assert_eq!(r.model(), "qwen3:8b");
    }

    #[tokio::test]
    async fn unreachable_server_is_a_request_error() {
        let r = OllamaResponder::new(Some("http://127.0.0.1:1".into()), None, None);
        assert!(matches!(r.complete("hola").await, Err(ResponderError::Request(_))));
    }
}
