//! Ephemeral action scopes: a paired "completed" broadcast is guaranteed for
//! every "active" broadcast, on every exit path, because completion happens
//! in `Drop`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use crate::bus::NotificationBus;
use crate::payload::{
    EphemeralErrorPayload,
    EphemeralPayload,
    EphemeralUpdates,
    NotificationPayload,
};

#[derive(Debug, Default, Clone)]
pub struct EphemeralOptions {
    pub layer_id: Option<String>,
    pub update_style_json: bool,
    pub bounds: Option<Vec<f64>>,
}

/// RAII scope around one tool body. Constructing broadcasts
/// `status: "active"`; dropping broadcasts the same payload with
/// `status: "completed"` and a completion timestamp.
pub struct EphemeralAction {
    bus: Arc<NotificationBus>,
    payload: EphemeralPayload,
}

impl EphemeralAction {
    pub async fn begin(
        bus: &Arc<NotificationBus>,
        conversation_id: i32,
        action: impl Into<String>,
    ) -> Self {
        Self::begin_with(bus, conversation_id, action, EphemeralOptions::default()).await
    }

    pub async fn begin_with(
        bus: &Arc<NotificationBus>,
        conversation_id: i32,
        action: impl Into<String>,
        options: EphemeralOptions,
    ) -> Self {
        let payload = EphemeralPayload {
            conversation_id,
            ephemeral: true,
            action_id: Uuid::new_v4().to_string(),
            layer_id: options.layer_id,
            action: action.into(),
            timestamp: Utc::now(),
            completed_at: None,
            status: "active".to_string(),
            bounds: options.bounds,
            updates: EphemeralUpdates {
                style_json: options.update_style_json,
            },
        };
        bus.broadcast(NotificationPayload::Ephemeral(payload.clone()));
        // Yield so the active payload flushes before the (often long) body
        // monopolizes the task.
        tokio::time::sleep(Duration::from_millis(50)).await;
        Self {
            bus: bus.clone(),
            payload,
        }
    }

    pub fn action_id(&self) -> &str {
        &self.payload.action_id
    }
}

impl Drop for EphemeralAction {
    fn drop(&mut self) {
        let mut finished = self.payload.clone();
        finished.status = "completed".to_string();
        finished.completed_at = Some(Utc::now());
        self.bus.broadcast(NotificationPayload::Ephemeral(finished));
    }
}

/// Sends a single ephemeral error notification to the conversation.
pub fn notify_error(bus: &NotificationBus, conversation_id: i32, error_message: impl Into<String>) {
    let payload = EphemeralErrorPayload {
        conversation_id,
        ephemeral: true,
        action_id: Uuid::new_v4().to_string(),
        error_message: error_message.into(),
        timestamp: Utc::now(),
        status: "error".to_string(),
    };
    bus.broadcast(NotificationPayload::EphemeralError(payload));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::NotificationPayload;

    async fn next_ephemeral(sub: &mut crate::bus::Subscription) -> EphemeralPayload {
        match sub.recv().await.unwrap() {
            NotificationPayload::Ephemeral(p) => p,
            other => panic!("expected ephemeral payload, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_scope_brackets_active_then_completed() {
        let bus = NotificationBus::new();
        let mut sub = bus.subscribe(Uuid::new_v4(), 5);

        {
            let action = EphemeralAction::begin_with(
                &bus,
                5,
                "Styling layer beaches...",
                EphemeralOptions {
                    layer_id: Some("L12345678901".to_string()),
                    update_style_json: true,
                    bounds: None,
                },
            )
            .await;
            let _ = action.action_id();
        }

        let active = next_ephemeral(&mut sub).await;
        assert_eq!(active.status, "active");
        assert_eq!(active.completed_at, None);
        assert_eq!(active.action, "Styling layer beaches...");
        assert!(active.updates.style_json);

        let completed = next_ephemeral(&mut sub).await;
        assert_eq!(completed.status, "completed");
        assert_eq!(completed.action_id, active.action_id);
        assert!(completed.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_scope_completes_on_early_error_return() {
        let bus = NotificationBus::new();
        let mut sub = bus.subscribe(Uuid::new_v4(), 5);

        async fn failing_tool(bus: &Arc<NotificationBus>) -> anyhow::Result<()> {
            let _action = EphemeralAction::begin(bus, 5, "Querying with SQL...").await;
            anyhow::bail!("table does not exist");
        }
        assert!(failing_tool(&bus).await.is_err());

        let active = next_ephemeral(&mut sub).await;
        let completed = next_ephemeral(&mut sub).await;
        assert_eq!(active.status, "active");
        assert_eq!(completed.status, "completed");
        assert_eq!(completed.action_id, active.action_id);
    }

    #[tokio::test]
    async fn test_zoom_scope_carries_bounds() {
        let bus = NotificationBus::new();
        let mut sub = bus.subscribe(Uuid::new_v4(), 5);

        let action = EphemeralAction::begin_with(
            &bus,
            5,
            "Zooming to 39 parcels",
            EphemeralOptions {
                bounds: Some(vec![-122.6, 37.6, -122.3, 37.9]),
                ..Default::default()
            },
        )
        .await;
        drop(action);

        let active = next_ephemeral(&mut sub).await;
        assert_eq!(active.bounds, Some(vec![-122.6, 37.6, -122.3, 37.9]));
    }

    #[tokio::test]
    async fn test_error_notification_is_single_shot() {
        let bus = NotificationBus::new();
        let mut sub = bus.subscribe(Uuid::new_v4(), 9);
        notify_error(&bus, 9, "Error connecting to LLM");
        match sub.recv().await.unwrap() {
            NotificationPayload::EphemeralError(err) => {
                assert_eq!(err.status, "error");
                assert_eq!(err.error_message, "Error connecting to LLM");
            },
            other => panic!("unexpected payload {other:?}"),
        }
    }
}
