//! Fan-out of notification payloads to live WebSocket subscribers, with a
//! per-(user, conversation) buffer of missed payloads for quick reconnects.

use std::collections::{
    HashMap,
    VecDeque,
};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

use crate::payload::NotificationPayload;

/// How long a disconnected (user, conversation) keeps accumulating missed
/// payloads before the entry is dropped.
pub const DISCONNECT_TTL: Duration = Duration::from_secs(30);
/// Missed-payload cap per (user, conversation); oldest entries drop first.
pub const MAX_MISSED_MESSAGES: usize = 100;
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

struct SubscriberQueue {
    id: u64,
    sender: mpsc::UnboundedSender<NotificationPayload>,
}

struct MissBuffer {
    disconnect_time: Instant,
    missed: VecDeque<(Instant, NotificationPayload)>,
}

#[derive(Default)]
struct BusInner {
    next_subscriber_id: u64,
    /// conversation id -> live subscriber queues.
    subscribers: HashMap<i32, Vec<SubscriberQueue>>,
    /// Recently disconnected (user, conversation) keys and what they missed.
    disconnected: HashMap<(Uuid, i32), MissBuffer>,
}

impl BusInner {
    fn evict_expired(&mut self, now: Instant) {
        self.disconnected
            .retain(|_, buffer| now.duration_since(buffer.disconnect_time) <= DISCONNECT_TTL);
    }

    fn buffer_for_disconnected(&mut self, conversation_id: i32, payload: &NotificationPayload) {
        let now = Instant::now();
        self.evict_expired(now);
        for ((_, disconnected_conversation), buffer) in self.disconnected.iter_mut() {
            if *disconnected_conversation != conversation_id {
                continue;
            }
            buffer.missed.push_back((now, payload.clone()));
            while buffer.missed.len() > MAX_MISSED_MESSAGES {
                buffer.missed.pop_front();
            }
        }
    }
}

/// Process-wide fan-out registry. Always used behind an `Arc`; the WebSocket
/// endpoint subscribes, everything else broadcasts.
pub struct NotificationBus {
    inner: Mutex<BusInner>,
}

impl NotificationBus {
    pub fn new() -> Arc<Self> {
        let bus = Arc::new(Self {
            inner: Mutex::new(BusInner::default()),
        });
        let sweeper = Arc::downgrade(&bus);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(SWEEP_INTERVAL).await;
                let Some(bus) = sweeper.upgrade() else {
                    break;
                };
                bus.inner.lock().evict_expired(Instant::now());
            }
        });
        bus
    }

    /// Delivers `payload` to every live subscriber of its conversation and
    /// appends it to the buffers of recently disconnected users of that
    /// conversation. Payloads without a resolved conversation are dropped.
    pub fn broadcast(&self, payload: NotificationPayload) {
        let Some(conversation_id) = payload.conversation_id() else {
            tracing::warn!("dropping notification payload without conversation id");
            return;
        };
        let mut inner = self.inner.lock();
        inner.buffer_for_disconnected(conversation_id, &payload);
        let mut now_empty = false;
        if let Some(queues) = inner.subscribers.get_mut(&conversation_id) {
            queues.retain(|queue| queue.sender.send(payload.clone()).is_ok());
            now_empty = queues.is_empty();
        }
        if now_empty {
            inner.subscribers.remove(&conversation_id);
        }
    }

    /// Registers a live subscriber for `(user, conversation)`. If that key
    /// disconnected within the TTL, its missed payloads are drained into the
    /// new queue, in order, before any live payload.
    pub fn subscribe(
        self: &Arc<Self>,
        user_id: Uuid,
        conversation_id: i32,
    ) -> Subscription {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        inner.evict_expired(Instant::now());
        if let Some(buffer) = inner.disconnected.remove(&(user_id, conversation_id)) {
            for (_, payload) in buffer.missed {
                _ = sender.send(payload);
            }
        }
        let id = inner.next_subscriber_id;
        inner.next_subscriber_id += 1;
        inner
            .subscribers
            .entry(conversation_id)
            .or_default()
            .push(SubscriberQueue { id, sender });
        Subscription {
            bus: self.clone(),
            user_id,
            conversation_id,
            subscriber_id: id,
            receiver,
        }
    }

    fn disconnect(&self, user_id: Uuid, conversation_id: i32, subscriber_id: u64) {
        let mut inner = self.inner.lock();
        let mut now_empty = false;
        if let Some(queues) = inner.subscribers.get_mut(&conversation_id) {
            queues.retain(|queue| queue.id != subscriber_id);
            now_empty = queues.is_empty();
        }
        if now_empty {
            inner.subscribers.remove(&conversation_id);
        }
        // Start collecting missed payloads in case this user reconnects to
        // this conversation shortly.
        inner.disconnected.insert(
            (user_id, conversation_id),
            MissBuffer {
                disconnect_time: Instant::now(),
                missed: VecDeque::new(),
            },
        );
    }
}

/// A live subscriber queue. Dropping it starts the miss-buffer window for
/// its (user, conversation).
pub struct Subscription {
    bus: Arc<NotificationBus>,
    user_id: Uuid,
    conversation_id: i32,
    subscriber_id: u64,
    receiver: mpsc::UnboundedReceiver<NotificationPayload>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<NotificationPayload> {
        self.receiver.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus
            .disconnect(self.user_id, self.conversation_id, self.subscriber_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::ReferencePayload;

    fn reference(id: i64, conversation_id: i32) -> NotificationPayload {
        NotificationPayload::Reference(ReferencePayload {
            id,
            conversation_id: Some(conversation_id),
            map_id: "M12345678901".to_string(),
        })
    }

    fn payload_id(payload: &NotificationPayload) -> i64 {
        match payload {
            NotificationPayload::Reference(r) => r.id,
            _ => panic!("expected reference"),
        }
    }

    #[tokio::test]
    async fn test_broadcast_reaches_all_live_subscribers_of_conversation() {
        let bus = NotificationBus::new();
        let user_a = Uuid::new_v4();
        let user_b = Uuid::new_v4();
        let mut sub_a = bus.subscribe(user_a, 1);
        let mut sub_b = bus.subscribe(user_b, 1);
        let mut other = bus.subscribe(user_a, 2);

        bus.broadcast(reference(10, 1));

        assert_eq!(payload_id(&sub_a.recv().await.unwrap()), 10);
        assert_eq!(payload_id(&sub_b.recv().await.unwrap()), 10);
        // Conversation 2 sees nothing.
        bus.broadcast(reference(11, 2));
        assert_eq!(payload_id(&other.recv().await.unwrap()), 11);
    }

    #[tokio::test]
    async fn test_quick_reconnect_replays_missed_payloads_in_order() {
        let bus = NotificationBus::new();
        let user = Uuid::new_v4();
        let sub = bus.subscribe(user, 1);
        drop(sub);

        for id in [1, 2, 3] {
            bus.broadcast(reference(id, 1));
        }

        let mut reconnected = bus.subscribe(user, 1);
        for expected in [1, 2, 3] {
            assert_eq!(payload_id(&reconnected.recv().await.unwrap()), expected);
        }
        // Replay precedes live: the next broadcast arrives after.
        bus.broadcast(reference(4, 1));
        assert_eq!(payload_id(&reconnected.recv().await.unwrap()), 4);
    }

    #[tokio::test]
    async fn test_replay_is_keyed_on_user_and_conversation() {
        let bus = NotificationBus::new();
        let user = Uuid::new_v4();
        let other_user = Uuid::new_v4();
        drop(bus.subscribe(user, 1));
        bus.broadcast(reference(7, 1));

        // A different user reconnecting to the same conversation gets no
        // replay of someone else's buffer.
        let (done_tx, mut done_rx) = tokio::sync::oneshot::channel::<()>();
        let mut stranger = bus.subscribe(other_user, 1);
        tokio::spawn(async move {
            // Nothing buffered for this key; recv only resolves for live
            // payloads sent after subscription.
            let payload = stranger.recv().await.unwrap();
            assert_eq!(payload_id(&payload), 8);
            _ = done_tx.send(());
        });
        bus.broadcast(reference(8, 1));
        done_rx.try_recv().ok();

        // The original user still gets their buffer.
        let mut reconnected = bus.subscribe(user, 1);
        assert_eq!(payload_id(&reconnected.recv().await.unwrap()), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_after_ttl_gets_no_replay() {
        let bus = NotificationBus::new();
        let user = Uuid::new_v4();
        drop(bus.subscribe(user, 1));
        bus.broadcast(reference(1, 1));

        tokio::time::advance(DISCONNECT_TTL + Duration::from_secs(1)).await;

        let mut reconnected = bus.subscribe(user, 1);
        // Only live payloads from here on.
        bus.broadcast(reference(2, 1));
        assert_eq!(payload_id(&reconnected.recv().await.unwrap()), 2);
    }

    #[tokio::test]
    async fn test_miss_buffer_caps_at_limit_dropping_oldest() {
        let bus = NotificationBus::new();
        let user = Uuid::new_v4();
        drop(bus.subscribe(user, 1));

        for id in 0..(MAX_MISSED_MESSAGES as i64 + 5) {
            bus.broadcast(reference(id, 1));
        }

        let mut reconnected = bus.subscribe(user, 1);
        // The first five were FIFO-dropped.
        assert_eq!(payload_id(&reconnected.recv().await.unwrap()), 5);
    }

    #[tokio::test]
    async fn test_replay_buffer_consumed_once() {
        let bus = NotificationBus::new();
        let user = Uuid::new_v4();
        drop(bus.subscribe(user, 1));
        bus.broadcast(reference(1, 1));

        let first = bus.subscribe(user, 1);
        drop(first);
        // The entry was consumed by the first reconnect; the second
        // disconnect starts an empty buffer.
        let mut second = bus.subscribe(user, 1);
        bus.broadcast(reference(2, 1));
        assert_eq!(payload_id(&second.recv().await.unwrap()), 2);
    }
}
