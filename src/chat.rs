//! Chat-completion client for OpenAI-compatible providers.
//!
//! The assistant talks to the model through the [`ChatModel`] trait so the
//! transport can be swapped (tests use an in-process stub). The bundled
//! [`OpenAiCompatChat`] posts to `{base_url}/chat/completions` and retries
//! 429/5xx/network failures with exponential backoff.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::config::ChatConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Model identifier, also used in answer cache keys.
    fn model_name(&self) -> &str;

    /// Send `messages` and return the trimmed reply text.
    async fn complete(&self, messages: &[ChatMessage], max_tokens: Option<u32>) -> Result<String>;
}

/// Client for `openai` and `groq` (or any compatible endpoint).
pub struct OpenAiCompatChat {
    client: reqwest::Client,
    url: String,
    model: String,
    api_key: String,
    temperature: f32,
    max_tokens: u32,
    max_retries: u32,
}

impl OpenAiCompatChat {
    pub fn new(config: &ChatConfig) -> Result<Self> {
        let key_env = config.api_key_env();
        let api_key = std::env::var(key_env).with_context(|| format!("{} not set", key_env))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            url: format!("{}/chat/completions", config.base_url()),
            model: config.model_name(),
            api_key,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl ChatModel for OpenAiCompatChat {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, messages: &[ChatMessage], max_tokens: Option<u32>) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "temperature": self.temperature,
            "max_tokens": max_tokens.unwrap_or(self.max_tokens),
        });

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post(&self.url)
                .header("Authorization", format!("Bearer {}", self.api_key))
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response.json().await?;
                        return parse_chat_response(&json);
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    if status.as_u16() == 429 || status.is_server_error() {
                        debug!(attempt, %status, "chat completion retry");
                        last_err = Some(anyhow::anyhow!("Chat API error {}: {}", status, body_text));
                        continue;
                    }

                    bail!("Chat API error {}: {}", status, body_text);
                }
                Err(e) => {
                    last_err = Some(e.into());
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("Chat completion failed after retries")))
    }
}

fn parse_chat_response(json: &serde_json::Value) -> Result<String> {
    let content = json
        .pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .ok_or_else(|| anyhow::anyhow!("Invalid chat response: missing choices[0].message.content"))?;

    let text = content.trim();
    if text.is_empty() {
        bail!("Chat model returned an empty reply");
    }
    Ok(text.to_string())
}

/// Build the configured chat model, or `None` when chat is disabled.
pub fn create_chat_model(config: &ChatConfig) -> Result<Option<Arc<dyn ChatModel>>> {
    if !config.is_enabled() {
        return Ok(None);
    }
    let model = OpenAiCompatChat::new(config)?;
    Ok(Some(Arc::new(model)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_chat_response() {
        let json = serde_json::json!({
            "choices": [{"message": {"role": "assistant", "content": "  Pikachu!  "}}]
        });
        assert_eq!(parse_chat_response(&json).unwrap(), "Pikachu!");
    }

    #[test]
    fn test_parse_chat_response_rejects_empty() {
        let json = serde_json::json!({"choices": [{"message": {"content": "   "}}]});
        assert!(parse_chat_response(&json).is_err());
        assert!(parse_chat_response(&serde_json::json!({})).is_err());
    }

    #[test]
    fn test_disabled_chat_has_no_model() {
        let cfg = ChatConfig::default();
        assert!(create_chat_model(&cfg).unwrap().is_none());
    }

    #[test]
    fn test_message_serialization() {
        let msg = ChatMessage::user("hola");
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            serde_json::json!({"role": "user", "content": "hola"})
        );
    }
}
