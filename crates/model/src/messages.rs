//! Chat message wire types.
//!
//! The stored `message_json` column round-trips exactly through
//! [`ChatMessage`]: what the LLM sent is what later iterations replay, so
//! the serde shapes here mirror the OpenAI chat-completions format.

use chrono::{
    DateTime,
    Utc,
};
use serde::{
    Deserialize,
    Serialize,
};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionCall {
    pub name: String,
    /// JSON-encoded argument object, kept as the raw string the LLM emitted.
    pub arguments: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub function: FunctionCall,
}

impl ToolCall {
    pub fn function_call(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: "function".to_string(),
            function: FunctionCall {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum ChatMessage {
    System {
        content: String,
    },
    User {
        content: String,
    },
    Assistant {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_calls: Option<Vec<ToolCall>>,
    },
    Tool {
        tool_call_id: String,
        content: String,
    },
}

impl ChatMessage {
    pub fn role(&self) -> &'static str {
        match self {
            ChatMessage::System { .. } => "system",
            ChatMessage::User { .. } => "user",
            ChatMessage::Assistant { .. } => "assistant",
            ChatMessage::Tool { .. } => "tool",
        }
    }

    pub fn tool_calls(&self) -> &[ToolCall] {
        match self {
            ChatMessage::Assistant {
                tool_calls: Some(calls),
                ..
            } => calls,
            _ => &[],
        }
    }

    pub fn content(&self) -> Option<&str> {
        match self {
            ChatMessage::System { content }
            | ChatMessage::User { content }
            | ChatMessage::Tool { content, .. } => Some(content),
            ChatMessage::Assistant { content, .. } => content.as_deref(),
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, result: &serde_json::Value) -> Self {
        ChatMessage::Tool {
            tool_call_id: tool_call_id.into(),
            content: result.to_string(),
        }
    }
}

/// A `chat_completion_messages` row.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub id: i64,
    pub map_id: String,
    pub conversation_id: i32,
    pub sender_id: Uuid,
    pub message: ChatMessage,
    pub created_at: DateTime<Utc>,
}

/// A tool call as shown to clients: the raw arguments are replaced with a
/// human-readable tagline and an icon name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SanitizedToolCall {
    pub id: String,
    pub tagline: String,
    pub icon: String,
}

/// The subset of a stored message sent to clients. System messages are never
/// sanitized; callers skip them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SanitizedMessage {
    pub id: i64,
    pub map_id: String,
    pub conversation_id: i32,
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<SanitizedToolCall>,
    /// For tool-role messages: the `status` field of the result JSON.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    pub created_at: DateTime<Utc>,
}

pub fn tagline_for_tool(name: &str) -> (String, &'static str) {
    match name {
        "new_layer_from_postgis" => ("Adding layer from PostGIS...".to_string(), "database"),
        "add_layer_to_map" => ("Adding layer to map...".to_string(), "plus"),
        "set_layer_style" => ("Setting layer style...".to_string(), "brush"),
        "query_duckdb_sql" => ("Querying with SQL...".to_string(), "table"),
        "query_postgis_database" => ("Querying PostgreSQL database...".to_string(), "database"),
        "zoom_to_bounds" => ("Zooming to bounds...".to_string(), "zoom-in"),
        "download_from_openstreetmap" => {
            ("Downloading from OpenStreetMap...".to_string(), "download")
        },
        // Geoprocessing tools are shown by their QGIS algorithm id.
        other => (other.replace('_', ":"), "wrench"),
    }
}

impl StoredMessage {
    /// Client-facing view of this message, or `None` for system messages.
    pub fn sanitize(&self) -> Option<SanitizedMessage> {
        match &self.message {
            ChatMessage::System { .. } => None,
            ChatMessage::User { content } => Some(SanitizedMessage {
                id: self.id,
                map_id: self.map_id.clone(),
                conversation_id: self.conversation_id,
                role: "user".to_string(),
                content: Some(content.clone()),
                tool_calls: Vec::new(),
                status: None,
                created_at: self.created_at,
            }),
            ChatMessage::Assistant {
                content,
                tool_calls,
            } => Some(SanitizedMessage {
                id: self.id,
                map_id: self.map_id.clone(),
                conversation_id: self.conversation_id,
                role: "assistant".to_string(),
                content: content.clone(),
                tool_calls: tool_calls
                    .as_deref()
                    .unwrap_or(&[])
                    .iter()
                    .map(|call| {
                        let (tagline, icon) = tagline_for_tool(&call.function.name);
                        SanitizedToolCall {
                            id: call.id.clone(),
                            tagline,
                            icon: icon.to_string(),
                        }
                    })
                    .collect(),
                status: None,
                created_at: self.created_at,
            }),
            ChatMessage::Tool { content, .. } => {
                let status = serde_json::from_str::<serde_json::Value>(content)
                    .ok()
                    .and_then(|v| v.get("status").and_then(|s| s.as_str()).map(String::from));
                Some(SanitizedMessage {
                    id: self.id,
                    map_id: self.map_id.clone(),
                    conversation_id: self.conversation_id,
                    role: "tool".to_string(),
                    content: None,
                    tool_calls: Vec::new(),
                    status,
                    created_at: self.created_at,
                })
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn stored(message: ChatMessage) -> StoredMessage {
        StoredMessage {
            id: 7,
            map_id: "M1234567890a".to_string(),
            conversation_id: 3,
            sender_id: Uuid::nil(),
            message,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_assistant_wire_format_matches_openai_shape() {
        let message = ChatMessage::Assistant {
            content: None,
            tool_calls: Some(vec![ToolCall::function_call(
                "call_1",
                "zoom_to_bounds",
                r#"{"bounds":[-1.0,-1.0,1.0,1.0],"zoom_description":"Zooming"}"#,
            )]),
        };
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["role"], "assistant");
        assert_eq!(value["tool_calls"][0]["type"], "function");
        assert_eq!(value["tool_calls"][0]["function"]["name"], "zoom_to_bounds");
        // `content` is omitted entirely, not null: some providers reject
        // assistant messages with both `content: null` and tool calls.
        assert!(value.get("content").is_none());

        let round_trip: ChatMessage = serde_json::from_value(value).unwrap();
        assert_eq!(round_trip, message);
    }

    #[test]
    fn test_tool_message_round_trip() {
        let raw = json!({
            "role": "tool",
            "tool_call_id": "call_9",
            "content": "{\"status\":\"success\",\"row_count\":1}",
        });
        let message: ChatMessage = serde_json::from_value(raw).unwrap();
        assert_eq!(message.role(), "tool");
        assert_eq!(
            message.content().unwrap(),
            "{\"status\":\"success\",\"row_count\":1}"
        );
    }

    #[test]
    fn test_system_messages_are_filtered() {
        let msg = stored(ChatMessage::System {
            content: "<MapState>secret</MapState>".to_string(),
        });
        assert!(msg.sanitize().is_none());
    }

    #[test]
    fn test_sanitized_tool_calls_carry_taglines() {
        let msg = stored(ChatMessage::Assistant {
            content: None,
            tool_calls: Some(vec![
                ToolCall::function_call("a", "set_layer_style", "{}"),
                ToolCall::function_call("b", "native_buffer", "{}"),
            ]),
        });
        let sanitized = msg.sanitize().unwrap();
        assert_eq!(sanitized.tool_calls[0].tagline, "Setting layer style...");
        assert_eq!(sanitized.tool_calls[0].icon, "brush");
        assert_eq!(sanitized.tool_calls[1].tagline, "native:buffer");
        // Raw arguments never reach the client.
        assert!(!serde_json::to_string(&sanitized).unwrap().contains("arguments"));
    }

    #[test]
    fn test_sanitized_tool_message_extracts_status() {
        let msg = stored(ChatMessage::Tool {
            tool_call_id: "call_1".to_string(),
            content: "{\"status\":\"error\",\"error\":\"table missing\"}".to_string(),
        });
        let sanitized = msg.sanitize().unwrap();
        assert_eq!(sanitized.role, "tool");
        assert_eq!(sanitized.status.as_deref(), Some("error"));
        // The raw result body stays server-side.
        assert!(sanitized.content.is_none());
    }
}
