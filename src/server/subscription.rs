// Subscription manager: one subscriber per queue, push on enqueue

use crate::server::store::Message;
use crate::smp::BrokerMsg;
use std::collections::HashMap;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

/// A transmission queued for a session's write loop. Pushes carry an empty
/// correlation id; command replies echo the command's.
#[derive(Debug)]
pub struct Outbound {
    pub corr_id: Vec<u8>,
    pub queue_id: Vec<u8>,
    pub msg: BrokerMsg,
}

pub type SessionSender = mpsc::UnboundedSender<Outbound>;

struct Subscriber {
    session_id: Uuid,
    tx: SessionSender,
    // a MSG is in flight and unACKed; no further push until cleared
    delivery_pending: bool,
}

/// Tracks which session subscribes to which queue. The manager owns only
/// channel senders; a dead session is detected on the next failed send and
/// cleaned up then, so sessions and the manager never reference each other
/// directly.
pub struct SubscriptionManager {
    subs: Mutex<HashMap<Vec<u8>, Subscriber>>,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self {
            subs: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribes `session_id` to the queue, evicting any prior subscriber
    /// with an `END` push.
    pub async fn subscribe(&self, recipient_id: &[u8], session_id: Uuid, tx: SessionSender) {
        let mut subs = self.subs.lock().await;
        if let Some(prior) = subs.get(recipient_id) {
            if prior.session_id != session_id {
                let _ = prior.tx.send(Outbound {
                    corr_id: Vec::new(),
                    queue_id: recipient_id.to_vec(),
                    msg: BrokerMsg::End,
                });
                tracing::debug!(
                    session = %prior.session_id,
                    queue = %hex::encode(&recipient_id[..recipient_id.len().min(4)]),
                    "evicting prior subscriber"
                );
            }
        }
        subs.insert(
            recipient_id.to_vec(),
            Subscriber {
                session_id,
                tx,
                delivery_pending: false,
            },
        );
    }

    /// Drops every subscription held by a terminating session.
    pub async fn unsubscribe_session(&self, session_id: Uuid) {
        let mut subs = self.subs.lock().await;
        subs.retain(|_, s| s.session_id != session_id);
    }

    /// Removes the subscription for one queue (queue deletion).
    pub async fn unsubscribe_queue(&self, recipient_id: &[u8]) {
        let mut subs = self.subs.lock().await;
        subs.remove(recipient_id);
    }

    /// Pushes `message` to the queue's subscriber unless a delivery is
    /// already pending. Returns whether a push went out.
    pub async fn deliver(&self, recipient_id: &[u8], message: Message) -> bool {
        let mut subs = self.subs.lock().await;
        let Some(sub) = subs.get_mut(recipient_id) else {
            return false;
        };
        if sub.delivery_pending {
            return false;
        }
        let sent = sub
            .tx
            .send(Outbound {
                corr_id: Vec::new(),
                queue_id: recipient_id.to_vec(),
                msg: BrokerMsg::Msg {
                    msg_id: message.msg_id,
                    timestamp: message.timestamp,
                    body: message.body,
                },
            })
            .is_ok();
        if sent {
            sub.delivery_pending = true;
        } else {
            // session is gone, clean up its entry now
            tracing::debug!(
                queue = %hex::encode(&recipient_id[..recipient_id.len().min(4)]),
                "dropping dead subscriber"
            );
            subs.remove(recipient_id);
        }
        sent
    }

    /// Clears the pending flag after the recipient ACKs.
    pub async fn clear_pending(&self, recipient_id: &[u8]) {
        let mut subs = self.subs.lock().await;
        if let Some(sub) = subs.get_mut(recipient_id) {
            sub.delivery_pending = false;
        }
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subs.lock().await.len()
    }
}

impl Default for SubscriptionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::random_id;

    fn msg(id: u64) -> Message {
        Message {
            msg_id: id,
            timestamp: 0,
            body: b"m".to_vec(),
        }
    }

    #[tokio::test]
    async fn test_single_subscriber_eviction() {
        let mgr = SubscriptionManager::new();
        let rid = random_id(24);
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, _rx_b) = mpsc::unbounded_channel();

        mgr.subscribe(&rid, Uuid::new_v4(), tx_a).await;
        mgr.subscribe(&rid, Uuid::new_v4(), tx_b).await;

        // the first session received END before being replaced
        let out = rx_a.recv().await.unwrap();
        assert!(matches!(out.msg, BrokerMsg::End));
        assert_eq!(out.queue_id, rid);
        assert_eq!(mgr.subscriber_count().await, 1);
    }

    #[tokio::test]
    async fn test_deliver_respects_pending() {
        let mgr = SubscriptionManager::new();
        let rid = random_id(24);
        let (tx, mut rx) = mpsc::unbounded_channel();
        mgr.subscribe(&rid, Uuid::new_v4(), tx).await;

        assert!(mgr.deliver(&rid, msg(1)).await);
        // second delivery is held until the first is ACKed
        assert!(!mgr.deliver(&rid, msg(2)).await);
        mgr.clear_pending(&rid).await;
        assert!(mgr.deliver(&rid, msg(2)).await);

        let first = rx.recv().await.unwrap();
        assert!(matches!(first.msg, BrokerMsg::Msg { msg_id: 1, .. }));
    }

    #[tokio::test]
    async fn test_dead_session_cleaned_on_send() {
        let mgr = SubscriptionManager::new();
        let rid = random_id(24);
        let (tx, rx) = mpsc::unbounded_channel();
        mgr.subscribe(&rid, Uuid::new_v4(), tx).await;
        drop(rx);

        assert!(!mgr.deliver(&rid, msg(1)).await);
        assert_eq!(mgr.subscriber_count().await, 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_session_removes_all() {
        let mgr = SubscriptionManager::new();
        let session = Uuid::new_v4();
        let (tx, _rx) = mpsc::unbounded_channel();
        mgr.subscribe(&random_id(24), session, tx.clone()).await;
        mgr.subscribe(&random_id(24), session, tx).await;

        mgr.unsubscribe_session(session).await;
        assert_eq!(mgr.subscriber_count().await, 0);
    }
}
