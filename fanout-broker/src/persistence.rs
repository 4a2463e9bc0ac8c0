//! Durable message log, one `sled` tree per topic.
//!
//! Messages are keyed by big-endian `seqId` inside their topic's tree so that
//! `scan` is a native `sled::Tree::range` call and ordering falls out of key
//! order for free. A small metadata tree alongside holds `currentSeqId`,
//! `consumedUntil`, and `messageBound` per topic.

use fanout_core::{Error, Result, Message, SeqId, SubscriberId, SubscriptionData};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct TopicMeta {
    current_seq: u64,
    consumed_until: u64,
    message_bound: Option<u64>,
}

/// Thin adapter over the durable log: sequential append, range scan from a
/// sequence id, consume-until GC hint, per-topic message bound.
pub struct PersistenceGateway {
    db: sled::Db,
    meta_tree: sled::Tree,
    subscriptions_tree: sled::Tree,
    topic_meta_cache: Arc<RwLock<HashMap<String, TopicMeta>>>,
}

impl PersistenceGateway {
    pub fn open(db_path: impl AsRef<std::path::Path>) -> Result<Self> {
        let db = sled::open(db_path).map_err(|e| Error::Storage(e.to_string()))?;
        let meta_tree = db
            .open_tree("topic_meta")
            .map_err(|e| Error::Storage(e.to_string()))?;
        let subscriptions_tree = db
            .open_tree("subscriptions")
            .map_err(|e| Error::Storage(e.to_string()))?;

        let mut cache = HashMap::new();
        for item in meta_tree.iter() {
            let (key, value) = item.map_err(|e| Error::Storage(e.to_string()))?;
            let topic = String::from_utf8(key.to_vec())
                .map_err(|e| Error::Storage(e.to_string()))?;
            let meta: TopicMeta =
                bincode::deserialize(&value).map_err(|e| Error::Storage(e.to_string()))?;
            cache.insert(topic, meta);
        }

        Ok(Self {
            db,
            meta_tree,
            subscriptions_tree,
            topic_meta_cache: Arc::new(RwLock::new(cache)),
        })
    }

    /// Key under which a subscriber's persisted record is stored: the topic,
    /// a NUL separator (never valid in either a topic or subscriber id byte
    /// string), then the subscriber id, so a prefix scan on `topic\0` finds
    /// every subscriber on that topic.
    fn subscription_key(topic: &str, subscriber_id: &SubscriberId) -> Vec<u8> {
        let mut key = topic.as_bytes().to_vec();
        key.push(0);
        key.extend_from_slice(subscriber_id.0.as_bytes());
        key
    }

    /// Persist (or overwrite) a subscriber's full record. Partial update is
    /// not supported; the whole record is written on every call.
    pub async fn save_subscription(
        &self,
        topic: &str,
        subscriber_id: &SubscriberId,
        data: &SubscriptionData,
    ) -> Result<()> {
        let value = bincode::serialize(data).map_err(|e| Error::Storage(e.to_string()))?;
        self.subscriptions_tree
            .insert(Self::subscription_key(topic, subscriber_id), value)
            .map_err(|e| Error::Storage(e.to_string()))?;
        Ok(())
    }

    /// Read every persisted subscriber record for `topic`, keyed by subscriber
    /// id. Used on topic acquire to repopulate the in-memory subscriber map.
    pub async fn load_subscriptions_for_topic(
        &self,
        topic: &str,
    ) -> Result<HashMap<SubscriberId, SubscriptionData>> {
        let mut prefix = topic.as_bytes().to_vec();
        prefix.push(0);

        let mut out = HashMap::new();
        for item in self.subscriptions_tree.scan_prefix(&prefix) {
            let (key, value) = item.map_err(|e| Error::Storage(e.to_string()))?;
            let subscriber_bytes = &key[prefix.len()..];
            let subscriber_id = SubscriberId(
                String::from_utf8(subscriber_bytes.to_vec())
                    .map_err(|e| Error::Storage(e.to_string()))?,
            );
            let data: SubscriptionData =
                bincode::deserialize(&value).map_err(|e| Error::Storage(e.to_string()))?;
            out.insert(subscriber_id, data);
        }
        Ok(out)
    }

    /// Delete a subscriber's persisted record. A no-op if none exists.
    pub async fn delete_subscription(&self, topic: &str, subscriber_id: &SubscriberId) -> Result<()> {
        self.subscriptions_tree
            .remove(Self::subscription_key(topic, subscriber_id))
            .map_err(|e| Error::Storage(e.to_string()))?;
        Ok(())
    }

    fn messages_tree(&self, topic: &str) -> Result<sled::Tree> {
        self.db
            .open_tree(format!("msgs:{topic}"))
            .map_err(|e| Error::Storage(e.to_string()))
    }

    async fn meta(&self, topic: &str) -> TopicMeta {
        self.topic_meta_cache
            .read()
            .await
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }

    async fn persist_meta(&self, topic: &str, meta: TopicMeta) -> Result<()> {
        let value = bincode::serialize(&meta).map_err(|e| Error::Storage(e.to_string()))?;
        self.meta_tree
            .insert(topic.as_bytes(), value)
            .map_err(|e| Error::Storage(e.to_string()))?;
        self.topic_meta_cache
            .write()
            .await
            .insert(topic.to_string(), meta);
        Ok(())
    }

    /// Append a payload, returning the assigned seqId. Fails the caller
    /// should have already confirmed ownership; this gateway itself does
    /// not check ownership.
    pub async fn append(&self, topic: &str, payload: Vec<u8>) -> Result<SeqId> {
        let mut meta = self.meta(topic).await;
        meta.current_seq += 1;
        let seq_id = SeqId(meta.current_seq);

        let tree = self.messages_tree(topic)?;
        let value =
            bincode::serialize(&payload).map_err(|e| Error::Storage(e.to_string()))?;
        tree.insert(seq_id.0.to_be_bytes(), value)
            .map_err(|e| Error::Storage(e.to_string()))?;
        tree.flush_async()
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;

        self.persist_meta(topic, meta).await?;
        Ok(seq_id)
    }

    /// Scan messages strictly after `from_seq_id`, up to `max_count` entries.
    pub async fn scan(
        &self,
        topic: &str,
        from_seq_id: SeqId,
        max_count: usize,
    ) -> Result<Vec<Message>> {
        let tree = self.messages_tree(topic)?;
        let start = (from_seq_id.0 + 1).to_be_bytes();
        let mut out = Vec::new();
        for item in tree.range(start..) {
            if out.len() >= max_count {
                break;
            }
            let (key, value) = item.map_err(|e| Error::Storage(e.to_string()))?;
            let seq = u64::from_be_bytes(
                key.as_ref()
                    .try_into()
                    .map_err(|_| Error::Storage("corrupt seq key".into()))?,
            );
            let payload: Vec<u8> =
                bincode::deserialize(&value).map_err(|e| Error::Storage(e.to_string()))?;
            out.push(Message {
                seq_id: SeqId(seq),
                payload,
            });
        }
        Ok(out)
    }

    pub async fn current_seq_id(&self, topic: &str) -> SeqId {
        SeqId(self.meta(topic).await.current_seq)
    }

    /// Advisory hint: messages with seqId ≤ `seq_id` are no longer needed by
    /// any subscriber on this node. The log may retain them longer regardless.
    pub async fn consumed_until(&self, topic: &str, seq_id: SeqId) -> Result<()> {
        let mut meta = self.meta(topic).await;
        meta.consumed_until = meta.consumed_until.max(seq_id.0);
        self.persist_meta(topic, meta).await
    }

    pub async fn set_message_bound(&self, topic: &str, n: u64) -> Result<()> {
        let mut meta = self.meta(topic).await;
        meta.message_bound = Some(n);
        self.persist_meta(topic, meta).await
    }

    pub async fn clear_message_bound(&self, topic: &str) -> Result<()> {
        let mut meta = self.meta(topic).await;
        meta.message_bound = None;
        self.persist_meta(topic, meta).await
    }

    pub async fn message_bound(&self, topic: &str) -> Option<u64> {
        self.meta(topic).await.message_bound
    }
}
