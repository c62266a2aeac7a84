//! Payloads carried on the chat notification channel.
//!
//! Two origins feed the same channel: the database trigger (reference
//! notifications pointing at a freshly inserted message row) and in-process
//! producers (ephemeral progress and error events).

use chrono::{
    DateTime,
    Utc,
};
use serde::{
    Deserialize,
    Serialize,
};

/// "A new message row with this id exists" - subscribers re-read the row and
/// emit a sanitized view. The trigger payload carries only `{id, map_id}`;
/// the listener resolves the conversation before fan-out.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReferencePayload {
    pub id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<i32>,
    pub map_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EphemeralUpdates {
    /// True when the map style likely changed and the frontend should
    /// refetch style.json.
    pub style_json: bool,
}

/// A lifecycle-scoped progress event bracketing one operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EphemeralPayload {
    pub conversation_id: i32,
    pub ephemeral: bool,
    pub action_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layer_id: Option<String>,
    pub action: String,
    pub timestamp: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounds: Option<Vec<f64>>,
    pub updates: EphemeralUpdates,
}

/// Fire-and-forget error event; not a scope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EphemeralErrorPayload {
    pub conversation_id: i32,
    pub ephemeral: bool,
    pub action_id: String,
    pub error_message: String,
    pub timestamp: DateTime<Utc>,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NotificationPayload {
    Reference(ReferencePayload),
    Ephemeral(EphemeralPayload),
    EphemeralError(EphemeralErrorPayload),
}

impl NotificationPayload {
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let value: serde_json::Value = serde_json::from_str(raw)?;
        if value.get("ephemeral").and_then(|v| v.as_bool()).unwrap_or(false) {
            if value.get("error_message").is_some() {
                Ok(Self::EphemeralError(serde_json::from_value(value)?))
            } else {
                Ok(Self::Ephemeral(serde_json::from_value(value)?))
            }
        } else {
            Ok(Self::Reference(serde_json::from_value(value)?))
        }
    }

    /// Conversation this payload routes to, if known. Trigger payloads start
    /// without one and are resolved by the listener.
    pub fn conversation_id(&self) -> Option<i32> {
        match self {
            Self::Reference(p) => p.conversation_id,
            Self::Ephemeral(p) => Some(p.conversation_id),
            Self::EphemeralError(p) => Some(p.conversation_id),
        }
    }

    /// JSON document sent over the WebSocket for ephemeral payloads.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Reference(p) => serde_json::to_value(p).expect("payload serializes"),
            Self::Ephemeral(p) => serde_json::to_value(p).expect("payload serializes"),
            Self::EphemeralError(p) => serde_json::to_value(p).expect("payload serializes"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_trigger_payload() {
        // Shape emitted by the AFTER INSERT trigger: no conversation_id.
        let payload = NotificationPayload::parse(r#"{"id": 42, "map_id": "M12345678901"}"#).unwrap();
        let NotificationPayload::Reference(reference) = payload else {
            panic!("expected reference payload");
        };
        assert_eq!(reference.id, 42);
        assert_eq!(reference.conversation_id, None);
        assert_eq!(reference.map_id, "M12345678901");
    }

    #[test]
    fn test_parse_ephemeral_payload() {
        let raw = r#"{
            "conversation_id": 3, "ephemeral": true, "action_id": "a-1",
            "layer_id": null, "action": "Kue is thinking...",
            "timestamp": "2025-06-20T05:03:40Z", "completed_at": null,
            "status": "active", "bounds": null, "updates": {"style_json": false}
        }"#;
        let payload = NotificationPayload::parse(raw).unwrap();
        assert!(matches!(payload, NotificationPayload::Ephemeral(_)));
        assert_eq!(payload.conversation_id(), Some(3));
    }

    #[test]
    fn test_parse_ephemeral_error_payload() {
        let raw = r#"{
            "conversation_id": 3, "ephemeral": true, "action_id": "a-2",
            "error_message": "Error connecting to LLM",
            "timestamp": "2025-06-20T05:03:40Z", "status": "error"
        }"#;
        let payload = NotificationPayload::parse(raw).unwrap();
        let NotificationPayload::EphemeralError(err) = payload else {
            panic!("expected error payload");
        };
        assert_eq!(err.status, "error");
        assert_eq!(err.error_message, "Error connecting to LLM");
    }
}
