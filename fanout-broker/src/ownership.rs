//! Topic ownership: which node is responsible for a topic right now.
//!
//! Ownership is recorded as a `sled` tree of owner records keyed `owners/<topic>`,
//! each carrying the holder's node identity and a lease token. A background task
//! periodically refreshes this node's own records (heartbeat); a second task
//! watches the tree via `sled::Tree::watch_prefix` and reports topics whose
//! record vanished or was overwritten by someone else, so a subscription manager
//! can tear down local state for a topic this node no longer owns.

use fanout_core::{Error, HostAddr, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, watch, RwLock};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OwnerRecord {
    holder: HostAddr,
    lease_token: u64,
    expires_at_ms: u64,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Outcome of a claim attempt.
#[derive(Debug, Clone)]
pub enum ClaimOutcome {
    /// This node now holds the topic.
    Acquired,
    /// Someone else holds it; redirect the caller there.
    Redirect(HostAddr),
}

pub struct OwnershipRegistry {
    tree: sled::Tree,
    node_id: HostAddr,
    lease_ttl: Duration,
    /// Topics this node currently believes it owns, refreshed by the heartbeat
    /// task and invalidated by the watch task.
    owned: Arc<RwLock<HashSet<String>>>,
}

impl OwnershipRegistry {
    pub fn new(db: &sled::Db, node_id: HostAddr, lease_ttl: Duration) -> Result<Self> {
        let tree = db
            .open_tree("owners")
            .map_err(|e| Error::Storage(e.to_string()))?;
        Ok(Self {
            tree,
            node_id,
            lease_ttl,
            owned: Arc::new(RwLock::new(HashSet::new())),
        })
    }

    fn key(topic: &str) -> Vec<u8> {
        format!("owners/{topic}").into_bytes()
    }

    fn read_record(&self, topic: &str) -> Result<Option<OwnerRecord>> {
        match self
            .tree
            .get(Self::key(topic))
            .map_err(|e| Error::Storage(e.to_string()))?
        {
            Some(bytes) => {
                let record: OwnerRecord = bincode::deserialize(&bytes)
                    .map_err(|e| Error::Storage(e.to_string()))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// Attempt to claim `topic`. Acquires if unclaimed, expired, or already
    /// held by this node (refresh); otherwise reports the current holder so
    /// the caller can redirect. Ties (two nodes racing an expired lease) are
    /// broken by `compare_and_swap`: only one writer's CAS succeeds, the loser
    /// re-reads and redirects to the winner.
    pub async fn claim(&self, topic: &str) -> Result<ClaimOutcome> {
        loop {
            let existing = self
                .tree
                .get(Self::key(topic))
                .map_err(|e| Error::Storage(e.to_string()))?;

            if let Some(bytes) = &existing {
                let record: OwnerRecord =
                    bincode::deserialize(bytes).map_err(|e| Error::Storage(e.to_string()))?;
                let stale = record.expires_at_ms < now_ms();
                if !stale && record.holder != self.node_id {
                    return Ok(ClaimOutcome::Redirect(record.holder));
                }
            }

            let new_record = OwnerRecord {
                holder: self.node_id.clone(),
                lease_token: now_ms(),
                expires_at_ms: now_ms() + self.lease_ttl.as_millis() as u64,
            };
            let new_bytes =
                bincode::serialize(&new_record).map_err(|e| Error::Storage(e.to_string()))?;

            let cas = self
                .tree
                .compare_and_swap(Self::key(topic), existing, Some(new_bytes))
                .map_err(|e| Error::Storage(e.to_string()))?;

            match cas {
                Ok(()) => {
                    self.owned.write().await.insert(topic.to_string());
                    return Ok(ClaimOutcome::Acquired);
                }
                Err(_) => continue,
            }
        }
    }

    /// Release a topic this node holds. A no-op if some other node's record is
    /// current (avoids releasing a lease we don't own after a failed claim race).
    pub async fn release(&self, topic: &str) -> Result<()> {
        if let Some(record) = self.read_record(topic)? {
            if record.holder == self.node_id {
                self.tree
                    .remove(Self::key(topic))
                    .map_err(|e| Error::Storage(e.to_string()))?;
            }
        }
        self.owned.write().await.remove(topic);
        Ok(())
    }

    pub async fn is_owner(&self, topic: &str) -> bool {
        self.owned.read().await.contains(topic)
    }

    pub async fn owned_topics(&self) -> Vec<String> {
        self.owned.read().await.iter().cloned().collect()
    }

    /// Refresh leases for all topics this node currently owns, at roughly
    /// `lease_ttl / 3` intervals, until `shutdown_rx` fires.
    pub async fn run_heartbeat(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let period = self.lease_ttl / 3;
        let mut ticker = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let topics = self.owned_topics().await;
                    for topic in topics {
                        if let Err(e) = self.claim(&topic).await {
                            tracing::warn!(topic = %topic, error = %e, "heartbeat refresh failed");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    }

    /// Watch the owner tree for externally vanished or overwritten keys that
    /// belonged to topics this node thought it owned, and report them on
    /// `released_tx` so the subscription manager can tear down local state.
    pub async fn run_watcher(
        self: Arc<Self>,
        released_tx: mpsc::UnboundedSender<String>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let mut subscriber = self.tree.watch_prefix(b"owners/");
        loop {
            tokio::select! {
                event = &mut subscriber => {
                    let Some(event) = event else { break };
                    subscriber = self.tree.watch_prefix(b"owners/");
                    self.handle_event(event, &released_tx).await;
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    }

    async fn handle_event(&self, event: sled::Event, released_tx: &mpsc::UnboundedSender<String>) {
        let (key, new_value) = match &event {
            sled::Event::Insert { key, value } => (key, Some(value)),
            sled::Event::Remove { key } => (key, None),
        };
        let Ok(key_str) = std::str::from_utf8(key) else {
            return;
        };
        let Some(topic) = key_str.strip_prefix("owners/") else {
            return;
        };
        if !self.is_owner(topic).await {
            return;
        }

        let still_ours = match new_value {
            Some(bytes) => bincode::deserialize::<OwnerRecord>(bytes)
                .map(|r| r.holder == self.node_id)
                .unwrap_or(false),
            None => false,
        };

        if !still_ours {
            self.owned.write().await.remove(topic);
            let _ = released_tx.send(topic.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> HostAddr {
        HostAddr::new("127.0.0.1", port, Some(port + 1))
    }

    #[tokio::test]
    async fn claim_acquires_unclaimed_topic() {
        let dir = tempfile::tempdir().unwrap();
        let db = sled::open(dir.path()).unwrap();
        let registry = OwnershipRegistry::new(&db, addr(9000), Duration::from_secs(30)).unwrap();

        let outcome = registry.claim("t").await.unwrap();
        assert!(matches!(outcome, ClaimOutcome::Acquired));
        assert!(registry.is_owner("t").await);
    }

    #[tokio::test]
    async fn claim_redirects_to_existing_holder() {
        let dir = tempfile::tempdir().unwrap();
        let db = sled::open(dir.path()).unwrap();
        let a = OwnershipRegistry::new(&db, addr(9000), Duration::from_secs(30)).unwrap();
        let b = OwnershipRegistry::new(&db, addr(9001), Duration::from_secs(30)).unwrap();

        a.claim("t").await.unwrap();
        let outcome = b.claim("t").await.unwrap();
        match outcome {
            ClaimOutcome::Redirect(host) => assert_eq!(host, addr(9000)),
            ClaimOutcome::Acquired => panic!("expected redirect"),
        }
    }

    #[tokio::test]
    async fn release_then_claim_by_another_node_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let db = sled::open(dir.path()).unwrap();
        let a = OwnershipRegistry::new(&db, addr(9000), Duration::from_secs(30)).unwrap();
        let b = OwnershipRegistry::new(&db, addr(9001), Duration::from_secs(30)).unwrap();

        a.claim("t").await.unwrap();
        a.release("t").await.unwrap();
        let outcome = b.claim("t").await.unwrap();
        assert!(matches!(outcome, ClaimOutcome::Acquired));
    }

    #[tokio::test]
    async fn expired_lease_can_be_reclaimed_by_another_node() {
        let dir = tempfile::tempdir().unwrap();
        let db = sled::open(dir.path()).unwrap();
        let a = OwnershipRegistry::new(&db, addr(9000), Duration::from_millis(1)).unwrap();
        let b = OwnershipRegistry::new(&db, addr(9001), Duration::from_secs(30)).unwrap();

        a.claim("t").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let outcome = b.claim("t").await.unwrap();
        assert!(matches!(outcome, ClaimOutcome::Acquired));
    }
}
