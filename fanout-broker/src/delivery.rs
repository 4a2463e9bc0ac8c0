//! FIFO message delivery: one session per `(topic, subscriber)` scanning the
//! durable log forward from the subscriber's last-consumed position, applying
//! the subscriber's filter chain, and writing admitted messages out.
//!
//! Grounded on the split send-task shape of the connection handler this
//! replaces: delivery runs independently of request handling, pushing onto a
//! bounded channel the connection's writer task drains. A slow subscriber
//! applies backpressure by not draining that channel; once a send blocks past
//! `backpressure_timeout` the session gives up and closes, rather than
//! buffering unboundedly for a subscriber that may never catch up.

use crate::persistence::PersistenceGateway;
use crate::subscription::SubscriptionManager;
use fanout_core::{DeliveredMessage, Error, Result, SeqId, ServerFrame, SubscriberId, Topic};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::AbortHandle;

const SCAN_BATCH: usize = 128;
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Tracks the one live delivery session allowed per `(topic, subscriber)`
/// pair on this node. Entries carry a monotonic session id alongside the
/// `AbortHandle` so a session's own cleanup-on-completion never races a
/// replacement session spawned in its place by a later `force_attach`.
pub struct DeliveryManager {
    persistence: Arc<PersistenceGateway>,
    subscriptions: Arc<SubscriptionManager>,
    backpressure_timeout: Duration,
    sessions: Arc<RwLock<HashMap<(Topic, SubscriberId), (u64, AbortHandle)>>>,
    next_session_id: AtomicU64,
}

impl DeliveryManager {
    pub fn new(
        persistence: Arc<PersistenceGateway>,
        subscriptions: Arc<SubscriptionManager>,
        backpressure_timeout: Duration,
    ) -> Self {
        Self {
            persistence,
            subscriptions,
            backpressure_timeout,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            next_session_id: AtomicU64::new(1),
        }
    }

    /// Spawn the delivery loop for a freshly subscribed `(topic, subscriber)`
    /// pair, starting just after `start_seq`. Enforces at most one live
    /// session per `(topic, subscriber)` on this node: if one already exists,
    /// `force_attach` decides whether it's aborted in favor of the new one or
    /// this call is rejected with `TopicBusy`.
    pub async fn spawn_session(
        &self,
        topic: Topic,
        subscriber_id: SubscriberId,
        start_seq: Option<SeqId>,
        force_attach: bool,
        outbound_tx: mpsc::Sender<ServerFrame>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Result<()> {
        let key = (topic.clone(), subscriber_id.clone());
        let mut sessions = self.sessions.write().await;

        if let Some((_, existing)) = sessions.get(&key) {
            if !force_attach {
                return Err(Error::TopicBusy);
            }
            existing.abort();
        }

        let persistence = self.persistence.clone();
        let subscriptions = self.subscriptions.clone();
        let backpressure_timeout = self.backpressure_timeout;
        let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        let start_seq = start_seq.unwrap_or(SeqId::ZERO);

        let task = tokio::spawn(run_delivery_loop(
            persistence,
            subscriptions,
            topic.clone(),
            subscriber_id.clone(),
            start_seq,
            outbound_tx,
            shutdown_rx,
            backpressure_timeout,
        ));
        let abort_handle = task.abort_handle();

        let sessions_table = self.sessions.clone();
        tokio::spawn(async move {
            let _ = task.await;
            let mut sessions = sessions_table.write().await;
            if matches!(sessions.get(&key), Some((id, _)) if *id == session_id) {
                sessions.remove(&key);
            }
        });

        sessions.insert(key, (session_id, abort_handle));
        Ok(())
    }

    /// Abort the live session for `(topic, subscriber)`, if any. Used on
    /// explicit unsubscribe so a stale session doesn't keep delivering to a
    /// subscriber that no longer exists.
    pub async fn terminate_session(&self, topic: &str, subscriber_id: &SubscriberId) {
        if let Some((_, handle)) = self
            .sessions
            .write()
            .await
            .remove(&(topic.to_string(), subscriber_id.clone()))
        {
            handle.abort();
        }
    }

    /// Abort every live session for `topic`. Used when this node releases
    /// ownership, so no delivery session keeps scanning a topic it no longer
    /// owns.
    pub async fn terminate_topic(&self, topic: &str) {
        let mut sessions = self.sessions.write().await;
        sessions.retain(|(session_topic, _), (_, handle)| {
            if session_topic == topic {
                handle.abort();
                false
            } else {
                true
            }
        });
    }
}

async fn run_delivery_loop(
    persistence: Arc<PersistenceGateway>,
    subscriptions: Arc<SubscriptionManager>,
    topic: Topic,
    subscriber_id: SubscriberId,
    start_seq: SeqId,
    outbound_tx: mpsc::Sender<ServerFrame>,
    mut shutdown_rx: watch::Receiver<bool>,
    backpressure_timeout: Duration,
) {
    let mut next_after = start_seq;

    loop {
        if *shutdown_rx.borrow() {
            return;
        }

        let messages = match persistence.scan(&topic, next_after, SCAN_BATCH).await {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(topic = %topic, subscriber = %subscriber_id, error = %e, "delivery scan failed");
                return;
            }
        };

        if messages.is_empty() {
            tokio::select! {
                _ = tokio::time::sleep(POLL_INTERVAL) => continue,
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        return;
                    }
                }
            }
            continue;
        }

        for message in messages {
            next_after = message.seq_id;

            if !subscriptions
                .message_admitted(&topic, &subscriber_id, &message)
                .await
            {
                continue;
            }

            let frame = ServerFrame::Delivery(DeliveredMessage {
                topic: topic.clone(),
                message,
            });

            match tokio::time::timeout(backpressure_timeout, outbound_tx.send(frame)).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => return,
                Err(_) => {
                    tracing::warn!(
                        topic = %topic,
                        subscriber = %subscriber_id,
                        "subscriber exceeded backpressure timeout, closing delivery session"
                    );
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::FilterRegistry;
    use fanout_core::{SubscribeMode, SubscriptionPreferences};

    #[tokio::test]
    async fn delivers_messages_appended_after_subscribe_start() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = Arc::new(PersistenceGateway::open(dir.path()).unwrap());
        let filters = Arc::new(FilterRegistry::new());
        let subscriptions = Arc::new(SubscriptionManager::new(persistence.clone(), filters, 10));

        subscriptions.acquire_topic("t").await;
        subscriptions
            .subscribe(
                "t",
                "alice".into(),
                SubscribeMode::Create,
                false,
                SubscriptionPreferences::default(),
                false,
            )
            .await
            .unwrap();

        persistence.append("t", b"one".to_vec()).await.unwrap();
        persistence.append("t", b"two".to_vec()).await.unwrap();

        let manager = DeliveryManager::new(persistence, subscriptions, Duration::from_secs(5));
        let (tx, mut rx) = mpsc::channel(16);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        manager
            .spawn_session("t".to_string(), "alice".into(), None, false, tx, shutdown_rx)
            .await
            .unwrap();

        let first = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let second = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();

        match (first, second) {
            (ServerFrame::Delivery(a), ServerFrame::Delivery(b)) => {
                assert_eq!(a.message.payload, b"one");
                assert_eq!(b.message.payload, b"two");
            }
            _ => panic!("expected delivery frames"),
        }
    }

    #[tokio::test]
    async fn closes_session_when_subscriber_never_drains() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = Arc::new(PersistenceGateway::open(dir.path()).unwrap());
        let filters = Arc::new(FilterRegistry::new());
        let subscriptions = Arc::new(SubscriptionManager::new(persistence.clone(), filters, 10));

        subscriptions.acquire_topic("t").await;
        subscriptions
            .subscribe(
                "t",
                "alice".into(),
                SubscribeMode::Create,
                false,
                SubscriptionPreferences::default(),
                false,
            )
            .await
            .unwrap();

        for i in 0..4u8 {
            persistence.append("t", vec![i]).await.unwrap();
        }

        let manager = DeliveryManager::new(persistence, subscriptions, Duration::from_millis(50));
        let (tx, rx) = mpsc::channel(1);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        manager
            .spawn_session("t".to_string(), "alice".into(), None, false, tx, shutdown_rx)
            .await
            .unwrap();

        // Never drain `rx`; the session should give up once the channel fills
        // and the send blocks past the backpressure timeout.
        tokio::time::sleep(Duration::from_millis(300)).await;
        drop(rx);
    }

    #[tokio::test]
    async fn second_session_without_force_attach_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = Arc::new(PersistenceGateway::open(dir.path()).unwrap());
        let filters = Arc::new(FilterRegistry::new());
        let subscriptions = Arc::new(SubscriptionManager::new(persistence.clone(), filters, 10));

        subscriptions.acquire_topic("t").await;
        subscriptions
            .subscribe(
                "t",
                "alice".into(),
                SubscribeMode::Create,
                false,
                SubscriptionPreferences::default(),
                false,
            )
            .await
            .unwrap();

        let manager = DeliveryManager::new(persistence, subscriptions, Duration::from_secs(5));
        let (tx1, _rx1) = mpsc::channel(16);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        manager
            .spawn_session("t".to_string(), "alice".into(), None, false, tx1, shutdown_rx.clone())
            .await
            .unwrap();

        let (tx2, _rx2) = mpsc::channel(16);
        let err = manager
            .spawn_session("t".to_string(), "alice".into(), None, false, tx2, shutdown_rx)
            .await
            .unwrap_err();
        assert!(matches!(err, fanout_core::Error::TopicBusy));
    }

    #[tokio::test]
    async fn force_attach_evicts_prior_session() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = Arc::new(PersistenceGateway::open(dir.path()).unwrap());
        let filters = Arc::new(FilterRegistry::new());
        let subscriptions = Arc::new(SubscriptionManager::new(persistence.clone(), filters, 10));

        subscriptions.acquire_topic("t").await;
        subscriptions
            .subscribe(
                "t",
                "alice".into(),
                SubscribeMode::Create,
                false,
                SubscriptionPreferences::default(),
                false,
            )
            .await
            .unwrap();
        persistence.append("t", b"one".to_vec()).await.unwrap();

        let manager = DeliveryManager::new(persistence, subscriptions, Duration::from_secs(5));
        let (tx1, mut rx1) = mpsc::channel(16);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        manager
            .spawn_session("t".to_string(), "alice".into(), None, false, tx1, shutdown_rx.clone())
            .await
            .unwrap();

        let (tx2, mut rx2) = mpsc::channel(16);
        manager
            .spawn_session("t".to_string(), "alice".into(), None, true, tx2, shutdown_rx)
            .await
            .unwrap();

        let delivered = tokio::time::timeout(Duration::from_secs(2), rx2.recv())
            .await
            .unwrap()
            .unwrap();
        match delivered {
            ServerFrame::Delivery(d) => assert_eq!(d.message.payload, b"one"),
            _ => panic!("expected delivery frame on the new session"),
        }

        // The evicted session's channel should never receive anything further.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx1.try_recv().is_err());
    }
}
