//! Per-topic subscription bookkeeping: consume pointers, preferences, and the
//! op-queuer that serializes subscribe/unsubscribe/consume against a topic's
//! subscriber set.
//!
//! Each acquired topic gets its own worker task reading from two bounded
//! channels, one fed by local subscribers and one by hub (cross-region)
//! imports, so a burst of local traffic cannot starve the hub path and vice
//! versa. Consume pointers are persisted lazily: a dirty counter defers the
//! `PersistenceGateway` write until `consume_interval` consumes have
//! accumulated, trading a bounded amount of redelivery-on-crash for avoiding a
//! storage write on every consume ack.
//!
//! Subscription records themselves are not lazy: `subscribe`/`unsubscribe`
//! persist before mutating the in-memory map, so a node that acquires a topic
//! after a prior owner crashed reloads every subscriber's last-consumed
//! pointer and preferences rather than starting them at a blank slate.

use crate::filter::{self, FilterRegistry, MessageFilter};
use crate::persistence::PersistenceGateway;
use fanout_core::{
    Error, Message, Result, SeqId, SubscribeMode, SubscribeResponseBody, SubscriberId,
    SubscriptionData, SubscriptionPreferences,
};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, RwLock};

const QUEUE_CAPACITY: usize = 256;

/// A cross-region federation hook, fired when a topic gains (or, on release,
/// loses) its first/last local subscriber. Returns a future so a listener can
/// do real I/O (e.g. open an upstream hub subscription) without pulling in an
/// async-trait dependency for a single callback shape.
pub type SubscriptionListener = Arc<dyn Fn(String) -> BoxFuture<'static, Result<()>> + Send + Sync>;

struct SubscriberState {
    last_consumed: SeqId,
    dirty_consumes: u64,
    preferences: SubscriptionPreferences,
    filter_chain: Vec<Box<dyn MessageFilter>>,
}

impl SubscriberState {
    fn to_record(&self) -> SubscriptionData {
        SubscriptionData {
            last_consumed: Some(self.last_consumed),
            preferences: self.preferences.clone(),
        }
    }
}

enum TopicOp {
    Subscribe {
        subscriber_id: SubscriberId,
        mode: SubscribeMode,
        force_attach: bool,
        preferences: SubscriptionPreferences,
        synchronous: bool,
        respond: oneshot::Sender<Result<SubscribeResponseBody>>,
    },
    Unsubscribe {
        subscriber_id: SubscriberId,
        respond: oneshot::Sender<Result<()>>,
    },
    Consume {
        subscriber_id: SubscriberId,
        seq_id: SeqId,
    },
}

struct TopicWorker {
    subscribers: RwLock<HashMap<SubscriberId, SubscriberState>>,
}

impl TopicWorker {
    fn new() -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
        }
    }

    async fn local_subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .await
            .keys()
            .filter(|id| !id.is_hub())
            .count()
    }

    /// Returns the response body plus whether this call created a brand-new
    /// subscriber entry (as opposed to attaching to / merging an existing
    /// one) — callers use that to decide whether a first-local-subscribe
    /// listener fires.
    async fn handle_subscribe(
        &self,
        subscriber_id: SubscriberId,
        mode: SubscribeMode,
        force_attach: bool,
        preferences: SubscriptionPreferences,
        filters: &FilterRegistry,
        persistence: &PersistenceGateway,
        topic: &str,
    ) -> Result<(SubscribeResponseBody, bool)> {
        let mut subs = self.subscribers.write().await;
        let exists = subs.contains_key(&subscriber_id);

        match mode {
            SubscribeMode::Create if exists && !force_attach => {
                return Err(Error::AlreadySubscribed);
            }
            SubscribeMode::Attach if !exists => {
                return Err(Error::NotSubscribed);
            }
            _ => {}
        }

        if let Some(state) = subs.get_mut(&subscriber_id) {
            state.preferences.merge(preferences);
            let record = state.to_record();
            persistence
                .save_subscription(topic, &subscriber_id, &record)
                .await?;
            return Ok((
                SubscribeResponseBody {
                    last_consumed: Some(state.last_consumed),
                },
                false,
            ));
        }

        let start_seq = persistence.current_seq_id(topic).await;
        let record = SubscriptionData {
            last_consumed: Some(start_seq),
            preferences: preferences.clone(),
        };
        persistence
            .save_subscription(topic, &subscriber_id, &record)
            .await?;

        let chain = filters.build_chain(preferences.message_filter.as_deref())?;
        subs.insert(
            subscriber_id,
            SubscriberState {
                last_consumed: start_seq,
                dirty_consumes: 0,
                preferences,
                filter_chain: chain,
            },
        );
        Ok((
            SubscribeResponseBody {
                last_consumed: Some(start_seq),
            },
            true,
        ))
    }

    /// Returns whether the removed subscriber was local, so the caller can
    /// decide whether a last-local-unsubscribe listener fires.
    async fn handle_unsubscribe(
        &self,
        subscriber_id: &SubscriberId,
        persistence: &PersistenceGateway,
        topic: &str,
    ) -> Result<bool> {
        let mut subs = self.subscribers.write().await;
        if !subs.contains_key(subscriber_id) {
            return Err(Error::NotSubscribed);
        }
        persistence.delete_subscription(topic, subscriber_id).await?;
        subs.remove(subscriber_id);
        Ok(!subscriber_id.is_hub())
    }

    async fn handle_consume(
        &self,
        subscriber_id: &SubscriberId,
        seq_id: SeqId,
        consume_interval: u64,
        persistence: &PersistenceGateway,
        topic: &str,
    ) {
        let mut subs = self.subscribers.write().await;
        let Some(state) = subs.get_mut(subscriber_id) else {
            return;
        };
        if seq_id <= state.last_consumed {
            return;
        }
        state.last_consumed = seq_id;
        state.dirty_consumes += 1;

        if state.dirty_consumes >= consume_interval {
            state.dirty_consumes = 0;
            let record = state.to_record();
            drop(subs);
            let _ = persistence.save_subscription(topic, subscriber_id, &record).await;
        }
    }

    async fn min_consumed(&self) -> Option<SeqId> {
        let subs = self.subscribers.read().await;
        subs.values().map(|s| s.last_consumed).min()
    }

    /// A bound applies only if every subscriber on the topic requested one;
    /// a single unbounded subscriber means retention must stay unbounded.
    async fn max_bound(&self) -> Option<u64> {
        let subs = self.subscribers.read().await;
        if subs.is_empty() || !subs.values().all(|s| s.preferences.message_bound.is_some()) {
            return None;
        }
        subs.values().filter_map(|s| s.preferences.message_bound).max()
    }

    async fn filter_chain_admits(&self, subscriber_id: &SubscriberId, message: &Message) -> bool {
        let subs = self.subscribers.read().await;
        match subs.get(subscriber_id) {
            Some(state) => filter::admits_all(&state.filter_chain, message),
            None => false,
        }
    }

    async fn subscriber_ids(&self) -> Vec<SubscriberId> {
        self.subscribers.read().await.keys().cloned().collect()
    }

    async fn last_consumed_of(&self, subscriber_id: &SubscriberId) -> Option<SeqId> {
        self.subscribers
            .read()
            .await
            .get(subscriber_id)
            .map(|s| s.last_consumed)
    }

    /// Load persisted records into a freshly created worker's map, ahead of
    /// marking the topic ready to serve. Returns whether any loaded record
    /// belongs to a local subscriber.
    async fn load_persisted(&self, filters: &FilterRegistry, persisted: HashMap<SubscriberId, SubscriptionData>) -> bool {
        let mut has_local = false;
        let mut subs = self.subscribers.write().await;
        for (subscriber_id, data) in persisted {
            has_local |= !subscriber_id.is_hub();
            let chain = filters
                .build_chain(data.preferences.message_filter.as_deref())
                .unwrap_or_else(|_| vec![Box::new(crate::filter::AllToAllTopology)]);
            subs.insert(
                subscriber_id,
                SubscriberState {
                    last_consumed: data.last_consumed.unwrap_or(SeqId::ZERO),
                    dirty_consumes: 0,
                    preferences: data.preferences,
                    filter_chain: chain,
                },
            );
        }
        has_local
    }

    /// Persist every subscriber's current state. Called before a topic is
    /// released so no unflushed consume progress is lost along with the
    /// in-memory map.
    async fn flush_all(&self, persistence: &PersistenceGateway, topic: &str) {
        let subs = self.subscribers.read().await;
        for (subscriber_id, state) in subs.iter() {
            let record = state.to_record();
            if let Err(e) = persistence.save_subscription(topic, subscriber_id, &record).await {
                tracing::warn!(topic = %topic, subscriber = %subscriber_id, error = %e, "failed to flush subscriber state on release");
            }
        }
    }
}

struct TopicHandle {
    local_tx: mpsc::Sender<TopicOp>,
    hub_tx: mpsc::Sender<TopicOp>,
    worker: Arc<TopicWorker>,
}

/// Tracks every topic this node currently owns: subscriber sets, consume
/// pointers, and the per-topic op-queuer that serializes writes against them.
pub struct SubscriptionManager {
    persistence: Arc<PersistenceGateway>,
    filters: Arc<FilterRegistry>,
    topics: RwLock<HashMap<String, Arc<TopicHandle>>>,
    consume_interval: u64,
    first_local_listeners: RwLock<Vec<SubscriptionListener>>,
    last_local_listeners: RwLock<Vec<SubscriptionListener>>,
}

impl SubscriptionManager {
    pub fn new(
        persistence: Arc<PersistenceGateway>,
        filters: Arc<FilterRegistry>,
        consume_interval: u64,
    ) -> Self {
        Self {
            persistence,
            filters,
            topics: RwLock::new(HashMap::new()),
            consume_interval,
            first_local_listeners: RwLock::new(Vec::new()),
            last_local_listeners: RwLock::new(Vec::new()),
        }
    }

    /// Register a listener fired (with the topic name) when a topic gains its
    /// first local subscriber, either on acquire (persisted records already
    /// had one) or on a fresh subscribe.
    pub async fn on_first_local_subscribe(&self, listener: SubscriptionListener) {
        self.first_local_listeners.write().await.push(listener);
    }

    /// Register a listener fired when a topic loses its last local
    /// subscriber, either via unsubscribe or topic release.
    pub async fn on_last_local_unsubscribe(&self, listener: SubscriptionListener) {
        self.last_local_listeners.write().await.push(listener);
    }

    async fn fire(listeners: &RwLock<Vec<SubscriptionListener>>, topic: &str) -> Result<()> {
        let listeners = listeners.read().await;
        for listener in listeners.iter() {
            listener(topic.to_string()).await?;
        }
        Ok(())
    }

    /// Start tracking a topic this node just acquired ownership of, loading
    /// any persisted subscriber records first so a node that reacquires a
    /// topic after a crash resumes from where the previous owner left off.
    pub async fn acquire_topic(&self, topic: &str) {
        let mut topics = self.topics.write().await;
        if topics.contains_key(topic) {
            return;
        }

        let worker = Arc::new(TopicWorker::new());
        let persisted = match self.persistence.load_subscriptions_for_topic(topic).await {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!(topic = %topic, error = %e, "failed to load persisted subscriptions on acquire");
                HashMap::new()
            }
        };
        let has_local = worker.load_persisted(&self.filters, persisted).await;

        if has_local {
            if let Err(e) = Self::fire(&self.first_local_listeners, topic).await {
                tracing::warn!(topic = %topic, error = %e, "first-local-subscribe listener failed on acquire");
            }
        }

        let (local_tx, mut local_rx) = mpsc::channel::<TopicOp>(QUEUE_CAPACITY);
        let (hub_tx, mut hub_rx) = mpsc::channel::<TopicOp>(QUEUE_CAPACITY);

        let worker_for_task = worker.clone();
        let persistence = self.persistence.clone();
        let filters = self.filters.clone();
        let consume_interval = self.consume_interval;
        let topic_owned = topic.to_string();
        let first_local_listeners = Arc::new(self.first_local_listeners.read().await.clone());
        let last_local_listeners = Arc::new(self.last_local_listeners.read().await.clone());

        tokio::spawn(async move {
            loop {
                let op = tokio::select! {
                    biased;
                    op = local_rx.recv() => op,
                    op = hub_rx.recv() => op,
                };
                let Some(op) = op else { break };
                Self::apply_op(
                    &worker_for_task,
                    &persistence,
                    &filters,
                    consume_interval,
                    &topic_owned,
                    &first_local_listeners,
                    &last_local_listeners,
                    op,
                )
                .await;
            }
        });

        topics.insert(
            topic.to_string(),
            Arc::new(TopicHandle {
                local_tx,
                hub_tx,
                worker,
            }),
        );
    }

    /// Stop tracking a topic this node no longer owns: flush every
    /// subscriber's current state to the metadata store first, so unflushed
    /// consume progress isn't lost, then drop the in-memory map. The worker
    /// task exits once both channel senders are dropped here.
    pub async fn release_topic(&self, topic: &str) {
        let Some(handle) = self.topics.write().await.remove(topic) else {
            return;
        };
        handle.worker.flush_all(&self.persistence, topic).await;

        if handle.worker.local_subscriber_count().await > 0 {
            if let Err(e) = Self::fire(&self.last_local_listeners, topic).await {
                tracing::warn!(topic = %topic, error = %e, "last-local-unsubscribe listener failed on release");
            }
        }
    }

    pub async fn is_tracked(&self, topic: &str) -> bool {
        self.topics.read().await.contains_key(topic)
    }

    #[allow(clippy::too_many_arguments)]
    async fn apply_op(
        worker: &Arc<TopicWorker>,
        persistence: &Arc<PersistenceGateway>,
        filters: &Arc<FilterRegistry>,
        consume_interval: u64,
        topic: &str,
        first_local_listeners: &Arc<Vec<SubscriptionListener>>,
        last_local_listeners: &Arc<Vec<SubscriptionListener>>,
        op: TopicOp,
    ) {
        match op {
            TopicOp::Subscribe {
                subscriber_id,
                mode,
                force_attach,
                preferences,
                synchronous,
                respond,
            } => {
                let is_local = !subscriber_id.is_hub();
                let was_empty_local = worker.local_subscriber_count().await == 0;

                let result = worker
                    .handle_subscribe(
                        subscriber_id.clone(),
                        mode,
                        force_attach,
                        preferences,
                        filters,
                        persistence,
                        topic,
                    )
                    .await;

                match result {
                    Ok((body, newly_created)) => {
                        if newly_created && is_local && was_empty_local {
                            let fire_now = async {
                                for listener in first_local_listeners.iter() {
                                    listener(topic.to_string()).await?;
                                }
                                Result::Ok(())
                            };

                            if synchronous {
                                if let Err(e) = fire_now.await {
                                    tracing::warn!(topic = %topic, subscriber = %subscriber_id, error = %e, "first-local-subscribe listener failed, rolling back subscribe");
                                    let _ = worker.handle_unsubscribe(&subscriber_id, persistence, topic).await;
                                    let _ = respond.send(Err(e));
                                    return;
                                }
                            } else {
                                let listeners = first_local_listeners.clone();
                                let topic_owned = topic.to_string();
                                tokio::spawn(async move {
                                    for listener in listeners.iter() {
                                        if let Err(e) = listener(topic_owned.clone()).await {
                                            tracing::warn!(topic = %topic_owned, error = %e, "first-local-subscribe listener failed");
                                        }
                                    }
                                });
                            }
                        }
                        let _ = respond.send(Ok(body));
                    }
                    Err(e) => {
                        let _ = respond.send(Err(e));
                    }
                }
            }
            TopicOp::Unsubscribe {
                subscriber_id,
                respond,
            } => {
                let result = worker.handle_unsubscribe(&subscriber_id, persistence, topic).await;
                match result {
                    Ok(was_last_local) => {
                        if was_last_local && worker.local_subscriber_count().await == 0 {
                            for listener in last_local_listeners.iter() {
                                if let Err(e) = listener(topic.to_string()).await {
                                    tracing::warn!(topic = %topic, error = %e, "last-local-unsubscribe listener failed");
                                }
                            }
                        }
                        let _ = respond.send(Ok(()));
                    }
                    Err(e) => {
                        let _ = respond.send(Err(e));
                    }
                }
            }
            TopicOp::Consume {
                subscriber_id,
                seq_id,
            } => {
                worker
                    .handle_consume(&subscriber_id, seq_id, consume_interval, persistence, topic)
                    .await;
            }
        }
    }

    fn queue_for(handle: &TopicHandle, subscriber_id: &SubscriberId) -> mpsc::Sender<TopicOp> {
        if subscriber_id.is_hub() {
            handle.hub_tx.clone()
        } else {
            handle.local_tx.clone()
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn subscribe(
        &self,
        topic: &str,
        subscriber_id: SubscriberId,
        mode: SubscribeMode,
        force_attach: bool,
        preferences: SubscriptionPreferences,
        synchronous: bool,
    ) -> Result<SubscribeResponseBody> {
        let handle = self
            .topics
            .read()
            .await
            .get(topic)
            .cloned()
            .ok_or(Error::ServerNotReady)?;

        let (respond, rx) = oneshot::channel();
        let tx = Self::queue_for(&handle, &subscriber_id);
        tx.send(TopicOp::Subscribe {
            subscriber_id,
            mode,
            force_attach,
            preferences,
            synchronous,
            respond,
        })
        .await
        .map_err(|_| Error::Internal("topic worker gone".into()))?;
        rx.await
            .map_err(|_| Error::Internal("topic worker dropped response".into()))?
    }

    pub async fn unsubscribe(&self, topic: &str, subscriber_id: SubscriberId) -> Result<()> {
        let handle = self
            .topics
            .read()
            .await
            .get(topic)
            .cloned()
            .ok_or(Error::NotSubscribed)?;

        let (respond, rx) = oneshot::channel();
        let tx = Self::queue_for(&handle, &subscriber_id);
        tx.send(TopicOp::Unsubscribe {
            subscriber_id,
            respond,
        })
        .await
        .map_err(|_| Error::Internal("topic worker gone".into()))?;
        rx.await
            .map_err(|_| Error::Internal("topic worker dropped response".into()))?
    }

    /// Fire-and-forget: advance a subscriber's consume pointer. No response
    /// frame is ever produced for this, matching `RequestBody::Consume`'s
    /// wire contract.
    pub async fn consume(&self, topic: &str, subscriber_id: SubscriberId, seq_id: SeqId) {
        let Some(handle) = self.topics.read().await.get(topic).cloned() else {
            return;
        };
        let tx = Self::queue_for(&handle, &subscriber_id);
        let _ = tx.send(TopicOp::Consume { subscriber_id, seq_id }).await;
    }

    pub async fn message_admitted(
        &self,
        topic: &str,
        subscriber_id: &SubscriberId,
        message: &Message,
    ) -> bool {
        match self.topics.read().await.get(topic) {
            Some(handle) => handle.worker.filter_chain_admits(subscriber_id, message).await,
            None => false,
        }
    }

    pub async fn last_consumed(&self, topic: &str, subscriber_id: &SubscriberId) -> Option<SeqId> {
        let handle = self.topics.read().await.get(topic).cloned()?;
        handle.worker.last_consumed_of(subscriber_id).await
    }

    pub async fn subscriber_ids(&self, topic: &str) -> Vec<SubscriberId> {
        match self.topics.read().await.get(topic) {
            Some(handle) => handle.worker.subscriber_ids().await,
            None => Vec::new(),
        }
    }

    pub async fn owned_topics(&self) -> Vec<String> {
        self.topics.read().await.keys().cloned().collect()
    }

    /// Compute the GC hint for a topic: the minimum consumed seqId across all
    /// subscribers, and the maximum message bound any subscriber requested.
    /// `None` if the topic currently has no subscribers at all.
    pub async fn gc_hint(&self, topic: &str) -> Option<(Option<SeqId>, Option<u64>)> {
        let handle = self.topics.read().await.get(topic).cloned()?;
        let min = handle.worker.min_consumed().await;
        let bound = handle.worker.max_bound().await;
        Some((min, bound))
    }
}
