//! OpenAI-compatible responder: POST {base}/chat/completions.
//!
//! Works against api.openai.com as well as local OpenAI-compatible servers (LM Studio, vLLM).

use crate::responder::{build_messages, non_empty, ChatMessage, Responder, ResponderError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub(crate) const DEFAULT_MODEL: &str = "gpt-4o-mini";

#[derive(Clone)]
pub struct OpenAiResponder {
    base_url: String,
    model: String,
    api_key: Option<String>,
    system_prompt: Option<String>,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiResponder {
    pub fn new(
        base_url: Option<String>,
        model: Option<String>,
        api_key: Option<String>,
        system_prompt: Option<String>,
    ) -> Self {
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
            api_key,
            system_prompt,
            client: reqwest::Client::new(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

fn first_choice_content(data: &CompletionResponse) -> &str {
    data.choices
        .first()
        .and_then(|c| c.message.content.as_deref())
        .unwrap_or("")
}

#[async_trait]
impl Responder for OpenAiResponder {
    async fn complete(&self, text: &str) -> Result<String, ResponderError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = CompletionRequest {
            model: &self.model,
            messages: build_messages(self.system_prompt.as_deref(), text),
            stream: false,
        };
        let mut req = self.client.post(&url).json(&body);
        if let Some(ref key) = self.api_key {
            req = req.bearer_auth(key);
        }
        log::debug!("openai: chat completion with model {}", self.model);
        let res = req.send().await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(ResponderError::Api(format!("{} {}", status, body)));
        }
        let data: CompletionResponse = res.json().await?;
        non_empty(first_choice_content(&data))
    }
}
