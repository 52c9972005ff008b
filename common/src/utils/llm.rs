use async_openai::{
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestSystemMessage, ChatCompletionRequestUserMessage,
        CreateChatCompletionRequestArgs, ResponseFormat,
    },
    Client,
};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;

use crate::error::AppError;

/// Narrow chat capability: JSON-mode completion returning the raw payload string.
///
/// Callers own JSON decoding and must treat a malformed payload as a skippable
/// outcome, never a crash.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn chat_json(
        &self,
        system: &str,
        user: &str,
        temperature: f32,
        max_tokens: u32,
    ) -> Result<String, AppError>;
}

pub struct OpenAiLlmClient {
    client: Client<OpenAIConfig>,
    model: String,
    timeout: Duration,
}

impl OpenAiLlmClient {
    pub fn new(client: Client<OpenAIConfig>, model: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            model: model.into(),
            timeout,
        }
    }
}

#[async_trait]
impl LlmClient for OpenAiLlmClient {
    async fn chat_json(
        &self,
        system: &str,
        user: &str,
        temperature: f32,
        max_tokens: u32,
    ) -> Result<String, AppError> {
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .temperature(temperature)
            .max_tokens(max_tokens)
            .response_format(ResponseFormat::JsonObject)
            .messages([
                ChatCompletionRequestSystemMessage::from(system).into(),
                ChatCompletionRequestUserMessage::from(user).into(),
            ])
            .build()?;

        let response = tokio::time::timeout(self.timeout, self.client.chat().create(request))
            .await
            .map_err(|_| AppError::Transient("chat completion deadline exceeded".into()))??;

        let content = response
            .choices
            .first()
            .and_then(|choice| choice.message.content.as_ref())
            .ok_or(AppError::Parse("No content found in LLM response".into()))?;

        debug!(chars = content.chars().count(), "chat completion received");

        Ok(content.clone())
    }
}

/// Decode a JSON payload from an LLM response, tolerating markdown code fences.
pub fn parse_json_payload<T: DeserializeOwned>(raw: &str) -> Result<T, AppError> {
    let trimmed = strip_code_fence(raw);
    serde_json::from_str::<T>(trimmed)
        .map_err(|e| AppError::Parse(format!("Failed to parse LLM response: {e}")))
}

fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };

    // Drop the info string ("json") up to the first newline, then the closing fence.
    let body = rest.split_once('\n').map_or(rest, |(_, body)| body);
    body.strip_suffix("```").unwrap_or(body).trim()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Deserialize, Debug, PartialEq)]
    struct Payload {
        answer: String,
    }

    #[test]
    fn parses_bare_json() {
        let parsed: Payload = parse_json_payload(r#"{"answer": "ok"}"#).expect("parse");
        assert_eq!(parsed.answer, "ok");
    }

    #[test]
    fn parses_fenced_json() {
        let raw = "```json\n{\"answer\": \"ok\"}\n```";
        let parsed: Payload = parse_json_payload(raw).expect("parse");
        assert_eq!(parsed.answer, "ok");
    }

    #[test]
    fn invalid_json_is_a_parse_error_not_a_panic() {
        let result = parse_json_payload::<Payload>("not json at all");
        assert!(matches!(result, Err(AppError::Parse(_))));
    }
}
