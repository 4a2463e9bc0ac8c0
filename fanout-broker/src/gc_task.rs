//! Periodic GC-hint computation: for each owned topic, derive `consumedUntil`
//! and the message bound purely from current subscriber state and push them
//! into the persistence gateway.
//!
//! Runs on an interval timer alongside a watch-channel shutdown signal. This
//! task only ever computes advisory hints derived from what subscribers have
//! actually consumed and requested; it never deletes anything, leaving that
//! to the storage layer's own compaction.

use crate::persistence::PersistenceGateway;
use crate::subscription::SubscriptionManager;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

pub async fn run_gc_task(
    persistence: Arc<PersistenceGateway>,
    subscriptions: Arc<SubscriptionManager>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                compute_hints(&persistence, &subscriptions).await;
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}

async fn compute_hints(persistence: &PersistenceGateway, subscriptions: &SubscriptionManager) {
    for topic in subscriptions.owned_topics().await {
        let Some((min_consumed, bound)) = subscriptions.gc_hint(&topic).await else {
            continue;
        };

        if let Some(seq_id) = min_consumed {
            if let Err(e) = persistence.consumed_until(&topic, seq_id).await {
                tracing::warn!(topic = %topic, error = %e, "failed to record consumed-until hint");
            }
        }

        let result = match bound {
            Some(n) => persistence.set_message_bound(&topic, n).await,
            None => persistence.clear_message_bound(&topic).await,
        };
        if let Err(e) = result {
            tracing::warn!(topic = %topic, error = %e, "failed to record message bound");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::FilterRegistry;
    use fanout_core::{SeqId, SubscribeMode, SubscriptionPreferences};

    #[tokio::test]
    async fn computes_consumed_until_and_bound_for_owned_topics() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = Arc::new(PersistenceGateway::open(dir.path()).unwrap());
        let filters = Arc::new(FilterRegistry::new());
        let subscriptions = Arc::new(SubscriptionManager::new(persistence.clone(), filters, 1));

        subscriptions.acquire_topic("t").await;
        let mut prefs = SubscriptionPreferences::default();
        prefs.message_bound = Some(50);
        subscriptions
            .subscribe("t", "alice".into(), SubscribeMode::Create, false, prefs, false)
            .await
            .unwrap();
        subscriptions.consume("t", "alice".into(), SeqId(7)).await;
        tokio::task::yield_now().await;

        compute_hints(&persistence, &subscriptions).await;

        assert_eq!(persistence.message_bound("t").await, Some(50));
    }
}
