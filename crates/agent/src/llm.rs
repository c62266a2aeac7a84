//! Thin client for an OpenAI-compatible chat-completions endpoint.
//!
//! The transcript is replayed verbatim from the stored `message_json` rows,
//! so the request/response types here lean on [`model::ChatMessage`] rather
//! than re-modeling the wire format.

use model::messages::{
    ChatMessage,
    ToolCall,
};
use serde::Deserialize;
use serde_json::Value as JsonValue;

pub const CONTEXT_LENGTH_EXCEEDED: &str = "context_length_exceeded";

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    /// The provider rejected the transcript for exceeding the model's
    /// context window. Terminal for the conversation.
    #[error("maximum context length exceeded")]
    ContextLengthExceeded,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Clone)]
pub struct AssistantReply {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
}

impl AssistantReply {
    pub fn into_message(self) -> ChatMessage {
        ChatMessage::Assistant {
            content: self.content,
            tool_calls: if self.tool_calls.is_empty() {
                None
            } else {
                Some(self.tool_calls)
            },
        }
    }
}

#[derive(Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCall>>,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: Option<ErrorDetail>,
}

#[derive(Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Clone)]
pub struct LlmClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

impl LlmClient {
    pub fn from_env() -> Self {
        let base_url = std::env::var("OPENAI_BASE_URL")
            .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
        let model = std::env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-4.1-nano".to_string());
        let api_key = std::env::var("OPENAI_API_KEY").ok();
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            api_key,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// One chat-completions round trip. `tools` is the JSON-schema list from
    /// the registry; pass an empty slice to disable tool calling (used by
    /// conversation labeling).
    pub async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: &[JsonValue],
        max_tokens: Option<u32>,
    ) -> Result<AssistantReply, LlmError> {
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": messages,
        });
        if !tools.is_empty() {
            body["tools"] = JsonValue::from(tools.to_vec());
            body["tool_choice"] = JsonValue::from("auto");
        }
        if let Some(max_tokens) = max_tokens {
            body["max_tokens"] = JsonValue::from(max_tokens);
        }

        let mut request = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .json(&body);
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| LlmError::Other(anyhow::Error::from(e).context("LLM request failed")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            if let Ok(parsed) = serde_json::from_str::<ErrorBody>(&text) {
                if let Some(detail) = parsed.error {
                    if detail.code.as_deref() == Some(CONTEXT_LENGTH_EXCEEDED) {
                        return Err(LlmError::ContextLengthExceeded);
                    }
                    return Err(LlmError::Other(anyhow::anyhow!(
                        "LLM error ({status}): {}",
                        detail.message.unwrap_or_default()
                    )));
                }
            }
            return Err(LlmError::Other(anyhow::anyhow!(
                "LLM error ({status}): {text}"
            )));
        }

        let completion: CompletionResponse = response
            .json()
            .await
            .map_err(|e| LlmError::Other(anyhow::Error::from(e).context("bad LLM response body")))?;
        let choice = completion
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::Other(anyhow::anyhow!("LLM response had no choices")))?;
        Ok(AssistantReply {
            content: choice.message.content,
            tool_calls: choice.message.tool_calls.unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_parsing_with_tool_calls() {
        let raw = r#"{
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_abc",
                        "type": "function",
                        "function": {"name": "zoom_to_bounds", "arguments": "{\"bounds\":[0,0,1,1]}"}
                    }]
                }
            }]
        }"#;
        let parsed: CompletionResponse = serde_json::from_str(raw).unwrap();
        let message = &parsed.choices[0].message;
        assert!(message.content.is_none());
        let calls = message.tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].function.name, "zoom_to_bounds");
    }

    #[test]
    fn test_context_length_error_body_shape() {
        let raw = r#"{"error": {"code": "context_length_exceeded", "message": "too long"}}"#;
        let parsed: ErrorBody = serde_json::from_str(raw).unwrap();
        assert_eq!(
            parsed.error.unwrap().code.as_deref(),
            Some(CONTEXT_LENGTH_EXCEEDED)
        );
    }

    #[test]
    fn test_assistant_reply_without_calls_omits_tool_calls() {
        let reply = AssistantReply {
            content: Some("done".to_string()),
            tool_calls: vec![],
        };
        let message = reply.into_message();
        assert!(message.tool_calls().is_empty());
        let value = serde_json::to_value(&message).unwrap();
        assert!(value.get("tool_calls").is_none());
    }
}
