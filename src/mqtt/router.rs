//! Inbound message fan-out.
//!
//! Every message the session receives becomes one [`IncomingMessage`]
//! broadcast to all current subscribers. The channel keeps a bounded replay
//! buffer; a subscriber that falls behind observes a `Lagged` error and
//! resumes from the oldest retained message. The publish path never blocks,
//! so a slow consumer cannot stall delivery to the others.

use chrono::{DateTime, Local};
use tokio::sync::broadcast;

/// Buffered messages retained for subscribers that start or lag briefly.
const REPLAY_CAPACITY: usize = 64;

/// One received (topic, payload) pair. Ephemeral; consumed and discarded.
#[derive(Clone, Debug)]
pub struct IncomingMessage {
    pub topic: String,
    pub payload: String,
    pub retained: bool,
    pub received_at: DateTime<Local>,
}

impl IncomingMessage {
    pub fn new(topic: String, payload: String, retained: bool) -> Self {
        Self {
            topic,
            payload,
            retained,
            received_at: Local::now(),
        }
    }
}

#[derive(Clone)]
pub struct InboundRouter {
    tx: broadcast::Sender<IncomingMessage>,
}

impl InboundRouter {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(REPLAY_CAPACITY);
        Self { tx }
    }

    /// Attach a subscriber. It receives every message dispatched after this
    /// call, in transport delivery order.
    pub fn subscribe(&self) -> broadcast::Receiver<IncomingMessage> {
        self.tx.subscribe()
    }

    /// Fan a message out to all subscribers. A send with no subscribers is
    /// not an error; the message is simply dropped.
    pub fn dispatch(&self, message: IncomingMessage) {
        let _ = self.tx.send(message);
    }
}

impl Default for InboundRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(n: usize) -> IncomingMessage {
        IncomingMessage::new("iot/nodes/esp-1/commands".to_string(), n.to_string(), false)
    }

    #[tokio::test]
    async fn every_subscriber_receives_every_message_in_order() {
        let router = InboundRouter::new();
        let mut a = router.subscribe();
        let mut b = router.subscribe();

        for n in 0..10 {
            router.dispatch(msg(n));
        }
        for n in 0..10 {
            assert_eq!(a.recv().await.unwrap().payload, n.to_string());
            assert_eq!(b.recv().await.unwrap().payload, n.to_string());
        }
    }

    #[tokio::test]
    async fn slow_subscriber_lags_without_blocking_fast_one() {
        let router = InboundRouter::new();
        let mut fast = router.subscribe();
        let mut slow = router.subscribe();

        // Overflow the replay buffer while `slow` reads nothing. Dispatch
        // must never block; `fast` keeps up concurrently.
        for n in 0..REPLAY_CAPACITY + 16 {
            router.dispatch(msg(n));
            assert_eq!(fast.recv().await.unwrap().payload, n.to_string());
        }

        // The slow subscriber sees the overflow, then resumes from the
        // oldest buffered message.
        match slow.recv().await {
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                assert_eq!(missed as usize, 16);
            }
            other => panic!("expected lag, got {other:?}"),
        }
        assert_eq!(slow.recv().await.unwrap().payload, "16");
    }

    #[tokio::test]
    async fn subscribers_only_see_messages_after_attachment() {
        let router = InboundRouter::new();
        router.dispatch(msg(0));
        let mut late = router.subscribe();
        router.dispatch(msg(1));
        assert_eq!(late.recv().await.unwrap().payload, "1");
    }
}
