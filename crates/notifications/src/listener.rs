//! The single process-wide LISTEN subscriber.
//!
//! Opens a dedicated connection to the application database, LISTENs on the
//! chat channel, and forwards every payload to the bus. Trigger payloads
//! carry no conversation id, so the listener resolves it by reading the
//! referenced row before fan-out.

use std::future;
use std::sync::Arc;
use std::task::{
    ready,
    Poll,
};
use std::time::Duration;

use pg::MundiPgPool;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_postgres::AsyncMessage;

use crate::bus::NotificationBus;
use crate::payload::NotificationPayload;

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Starts the listener task. It reconnects with a delay whenever the
/// dedicated connection drops.
pub fn spawn_chat_listener(
    bus: Arc<NotificationBus>,
    app_pool: Arc<MundiPgPool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if let Err(e) = run_listener(&bus, &app_pool).await {
                tracing::error!("chat listener failed: {e:#}");
            } else {
                tracing::warn!("chat listener connection closed; reconnecting");
            }
            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    })
}

async fn run_listener(bus: &Arc<NotificationBus>, app_pool: &Arc<MundiPgPool>) -> anyhow::Result<()> {
    let config = pg::app_db_config()?;
    let (client, mut connection) = config.connect(pg::permissive_tls()).await?;

    let (notify_tx, mut notify_rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(future::poll_fn(move |cx| loop {
        match ready!(connection.poll_message(cx)) {
            Some(Ok(AsyncMessage::Notification(notification))) => {
                _ = notify_tx.send(notification.payload().to_string());
            },
            Some(Ok(_)) => {},
            Some(Err(e)) => {
                tracing::error!("listener connection error: {e}");
                return Poll::Ready(());
            },
            None => return Poll::Ready(()),
        }
    }));

    client
        .batch_execute(&format!("LISTEN {}", pg::bootstrap::CHAT_NOTIFY_CHANNEL))
        .await?;
    tracing::info!("listening on {}", pg::bootstrap::CHAT_NOTIFY_CHANNEL);

    // The channel closes when the driver task observes the connection die,
    // which bounces us back out to the reconnect loop.
    while let Some(raw) = notify_rx.recv().await {
        if let Err(e) = handle_payload(bus, app_pool, &raw).await {
            tracing::error!("error broadcasting notification payload: {e:#}");
        }
    }
    drop(client);
    Ok(())
}

async fn handle_payload(
    bus: &Arc<NotificationBus>,
    app_pool: &Arc<MundiPgPool>,
    raw: &str,
) -> anyhow::Result<()> {
    let mut payload = NotificationPayload::parse(raw)?;
    if let NotificationPayload::Reference(reference) = &mut payload {
        if reference.conversation_id.is_none() {
            let conn = app_pool.acquire("resolve_notification_conversation").await?;
            let row = conn
                .query_opt(
                    "SELECT conversation_id FROM chat_completion_messages WHERE id = $1",
                    &[&reference.id],
                )
                .await?;
            let Some(row) = row else {
                anyhow::bail!("reference notification for unknown message {}", reference.id);
            };
            reference.conversation_id = Some(row.get("conversation_id"));
        }
    }
    bus.broadcast(payload);
    Ok(())
}
