//! Stream bus: per-(chat, stream) event fan-out.
//!
//! Every subscription owns its own bounded channel, so one slow consumer
//! never blocks the others. Writers wait at most `publish_timeout`; on
//! timeout the event is dropped and a `subscriber-lagged` marker is
//! delivered instead. The marker rides a reserved one-slot side channel
//! that the receiver drains before its next channel read, so it survives
//! even when the event buffer stays full. Each subscription has a
//! keepalive ticker and an idempotent cancellation signal.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::{debug, warn};

use crate::errors::{NeoError, NeoResult};
use crate::types::{StreamEventKind, StreamResponse};

const SUBSCRIPTION_BUFFER: usize = 64;

/// Cooperative cancellation signal shared between a stream consumer and the
/// work producing into it. Cancel is idempotent.
#[derive(Clone, Debug, Default)]
pub struct CancelHandle {
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            self.notify.notify_waiters();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once cancelled; usable inside `tokio::select!`.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        let notified = self.notify.notified();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }

    /// Maps the cancelled state to the typed error, for use at the
    /// pipeline's cancellation points.
    pub fn check(&self) -> NeoResult<()> {
        if self.is_cancelled() {
            Err(NeoError::cancelled())
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct StreamKey {
    chat_id: String,
    stream_id: String,
}

struct Subscription {
    user_id: String,
    sender: mpsc::Sender<StreamResponse>,
    lag_pending: Arc<AtomicBool>,
    cancel: CancelHandle,
}

/// Receiver half of a subscription. Merges the reserved lag slot with the
/// event channel: a pending `subscriber-lagged` marker is always delivered
/// before the next queued event.
pub struct StreamReceiver {
    inner: mpsc::Receiver<StreamResponse>,
    lag_pending: Arc<AtomicBool>,
    stream_id: String,
}

impl StreamReceiver {
    fn lag_marker(&self) -> StreamResponse {
        StreamResponse::new(
            StreamEventKind::SubscriberLagged,
            json!({ "error": NeoError::subscriber_lagged(&self.stream_id).to_string() }),
        )
    }

    pub async fn recv(&mut self) -> Option<StreamResponse> {
        if self.lag_pending.swap(false, Ordering::SeqCst) {
            return Some(self.lag_marker());
        }
        self.inner.recv().await
    }

    pub fn try_recv(&mut self) -> Result<StreamResponse, mpsc::error::TryRecvError> {
        if self.lag_pending.swap(false, Ordering::SeqCst) {
            return Ok(self.lag_marker());
        }
        self.inner.try_recv()
    }
}

/// Consumer half of a subscription.
pub struct StreamSubscription {
    pub chat_id: String,
    pub user_id: String,
    pub stream_id: String,
    pub receiver: StreamReceiver,
    pub cancel: CancelHandle,
}

pub struct StreamBus {
    subscriptions: Arc<Mutex<HashMap<StreamKey, Subscription>>>,
    publish_timeout: Duration,
    keepalive_interval: Duration,
}

impl StreamBus {
    pub fn new(publish_timeout: Duration, keepalive_interval: Duration) -> Self {
        Self {
            subscriptions: Arc::new(Mutex::new(HashMap::new())),
            publish_timeout,
            keepalive_interval,
        }
    }

    /// Registers a subscription for (chat, stream) and starts its keepalive
    /// ticker. A re-subscribe with the same key replaces the previous
    /// subscription, completing it first.
    pub async fn subscribe(
        &self,
        chat_id: &str,
        user_id: &str,
        stream_id: &str,
    ) -> StreamSubscription {
        let key = StreamKey {
            chat_id: chat_id.to_string(),
            stream_id: stream_id.to_string(),
        };
        let (sender, receiver) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let lag_pending = Arc::new(AtomicBool::new(false));
        let cancel = CancelHandle::new();

        let previous = {
            let mut subs = self.subscriptions.lock().await;
            subs.insert(
                key.clone(),
                Subscription {
                    user_id: user_id.to_string(),
                    sender: sender.clone(),
                    lag_pending: lag_pending.clone(),
                    cancel: cancel.clone(),
                },
            )
        };
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }

        self.spawn_keepalive(sender, cancel.clone());
        debug!(chat_id, stream_id, "stream subscription registered");

        StreamSubscription {
            chat_id: chat_id.to_string(),
            user_id: user_id.to_string(),
            stream_id: stream_id.to_string(),
            receiver: StreamReceiver {
                inner: receiver,
                lag_pending,
                stream_id: stream_id.to_string(),
            },
            cancel,
        }
    }

    fn spawn_keepalive(&self, sender: mpsc::Sender<StreamResponse>, cancel: CancelHandle) {
        let interval = self.keepalive_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let event = StreamResponse::new(StreamEventKind::Keepalive, json!({}));
                        if sender.send(event).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });
    }

    /// Delivers an event to one (chat, stream) subscription. Best-effort:
    /// events for unknown streams are dropped, and a subscriber that cannot
    /// keep up within the publish timeout loses the event and is offered a
    /// `subscriber-lagged` marker instead.
    pub async fn publish(&self, chat_id: &str, stream_id: &str, response: StreamResponse) {
        let target = {
            let subs = self.subscriptions.lock().await;
            let key = StreamKey {
                chat_id: chat_id.to_string(),
                stream_id: stream_id.to_string(),
            };
            subs.get(&key)
                .map(|s| (s.sender.clone(), s.lag_pending.clone()))
        };
        let Some((sender, lag_pending)) = target else {
            debug!(chat_id, stream_id, event = response.event.as_str(), "no subscriber, event dropped");
            return;
        };

        let event_name = response.event.as_str();
        match tokio::time::timeout(self.publish_timeout, sender.send(response)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                debug!(chat_id, stream_id, event = event_name, "subscriber closed, event dropped");
            }
            Err(_) => {
                warn!(chat_id, stream_id, event = event_name, "subscriber lagged, event dropped");
                let lagged = StreamResponse::new(
                    StreamEventKind::SubscriberLagged,
                    json!({ "error": NeoError::subscriber_lagged(stream_id).to_string() }),
                );
                if sender.try_send(lagged).is_err() {
                    // Channel still full: park the marker in the reserved
                    // slot; the receiver drains it before its next read.
                    lag_pending.store(true, Ordering::SeqCst);
                }
            }
        }
    }

    /// Emits `complete` and tears the subscription down.
    pub async fn complete(&self, chat_id: &str, stream_id: &str) {
        self.publish(
            chat_id,
            stream_id,
            StreamResponse::new(StreamEventKind::Complete, json!({})),
        )
        .await;
        self.remove(chat_id, stream_id).await;
    }

    /// Cancels a subscription's signal. Safe to call repeatedly and for
    /// unknown streams.
    pub async fn cancel(&self, chat_id: &str, stream_id: &str) {
        let subs = self.subscriptions.lock().await;
        let key = StreamKey {
            chat_id: chat_id.to_string(),
            stream_id: stream_id.to_string(),
        };
        if let Some(sub) = subs.get(&key) {
            sub.cancel.cancel();
        }
    }

    /// Drops the subscription; the consumer side observes channel close.
    pub async fn remove(&self, chat_id: &str, stream_id: &str) {
        let mut subs = self.subscriptions.lock().await;
        let key = StreamKey {
            chat_id: chat_id.to_string(),
            stream_id: stream_id.to_string(),
        };
        if let Some(sub) = subs.remove(&key) {
            sub.cancel.cancel();
            debug!(chat_id, stream_id, "stream subscription removed");
        }
    }

    /// Cancellation signal for a live subscription, if any.
    pub async fn cancel_handle(&self, chat_id: &str, stream_id: &str) -> Option<CancelHandle> {
        let subs = self.subscriptions.lock().await;
        let key = StreamKey {
            chat_id: chat_id.to_string(),
            stream_id: stream_id.to_string(),
        };
        subs.get(&key).map(|s| s.cancel.clone())
    }

    /// Stream ids currently subscribed for a chat, with their owners.
    pub async fn subscribers_of(&self, chat_id: &str) -> Vec<(String, String)> {
        let subs = self.subscriptions.lock().await;
        subs.iter()
            .filter(|(key, _)| key.chat_id == chat_id)
            .map(|(key, sub)| (key.stream_id.clone(), sub.user_id.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bus() -> StreamBus {
        StreamBus::new(Duration::from_millis(50), Duration::from_secs(30))
    }

    #[tokio::test]
    async fn publish_reaches_subscriber_in_order() {
        let bus = bus();
        let mut sub = bus.subscribe("c1", "u1", "s1").await;

        for i in 0..3 {
            bus.publish(
                "c1",
                "s1",
                StreamResponse::new(StreamEventKind::AiResponseStep, json!(i)),
            )
            .await;
        }

        for i in 0..3 {
            let event = sub.receiver.recv().await.unwrap();
            assert_eq!(event.data, json!(i));
        }
    }

    #[tokio::test]
    async fn publish_without_subscriber_is_dropped() {
        let bus = bus();
        bus.publish(
            "c1",
            "missing",
            StreamResponse::new(StreamEventKind::AiResponse, json!({})),
        )
        .await;
    }

    #[tokio::test]
    async fn slow_subscriber_gets_lag_marker() {
        let bus = bus();
        let mut sub = bus.subscribe("c1", "u1", "s1").await;

        // Fill the buffer past capacity without consuming: the overflowing
        // event is dropped and replaced by a lag marker.
        for i in 0..(SUBSCRIPTION_BUFFER + 1) {
            bus.publish(
                "c1",
                "s1",
                StreamResponse::new(StreamEventKind::AiResponseStep, json!(i)),
            )
            .await;
        }

        let mut saw_lagged = false;
        for _ in 0..(SUBSCRIPTION_BUFFER + 1) {
            let event = sub.receiver.recv().await.unwrap();
            if event.event == StreamEventKind::SubscriberLagged {
                saw_lagged = true;
            }
        }
        assert!(saw_lagged);
    }

    #[tokio::test]
    async fn lag_marker_survives_a_stalled_consumer() {
        let bus = bus();
        let mut sub = bus.subscribe("c1", "u1", "s1").await;

        for i in 0..(SUBSCRIPTION_BUFFER + 1) {
            bus.publish(
                "c1",
                "s1",
                StreamResponse::new(StreamEventKind::AiResponseStep, json!(i)),
            )
            .await;
        }

        // The consumer stalls well past the publish timeout before touching
        // the channel; the marker must still be waiting, ahead of the
        // buffered events.
        tokio::time::sleep(Duration::from_millis(300)).await;

        let first = sub.receiver.recv().await.unwrap();
        assert_eq!(first.event, StreamEventKind::SubscriberLagged);
        for i in 0..SUBSCRIPTION_BUFFER {
            assert_eq!(sub.receiver.recv().await.unwrap().data, json!(i));
        }
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let bus = bus();
        let sub = bus.subscribe("c1", "u1", "s1").await;
        bus.cancel("c1", "s1").await;
        bus.cancel("c1", "s1").await;
        assert!(sub.cancel.is_cancelled());
        assert!(sub.cancel.check().is_err());
    }

    #[tokio::test]
    async fn complete_closes_the_channel() {
        let bus = bus();
        let mut sub = bus.subscribe("c1", "u1", "s1").await;
        bus.complete("c1", "s1").await;

        let event = sub.receiver.recv().await.unwrap();
        assert_eq!(event.event, StreamEventKind::Complete);
        assert!(sub.receiver.recv().await.is_none());
    }

    #[tokio::test]
    async fn resubscribe_replaces_previous_subscription() {
        let bus = bus();
        let first = bus.subscribe("c1", "u1", "s1").await;
        let mut second = bus.subscribe("c1", "u1", "s1").await;
        assert!(first.cancel.is_cancelled());

        bus.publish(
            "c1",
            "s1",
            StreamResponse::new(StreamEventKind::DbStatus, json!("ok")),
        )
        .await;
        assert_eq!(second.receiver.recv().await.unwrap().data, json!("ok"));
    }
}
