//! Per-subscription connection state machine.
//!
//! Tracks a logical subscription's lifecycle across physical channels and
//! redirects, distinct from the physical channel's own up/down status. A
//! single subscription may churn through several TCP connections (redirects,
//! reconnects) while staying in the same logical state.
//!
//! # States
//!
//! - **Connecting**: dialing the current candidate host
//! - **AwaitAck**: connected, request sent, waiting on the server's ack
//! - **Active**: ack received, delivery may be flowing
//! - **Reconnecting**: the active channel dropped, backing off before retry
//! - **Failed**: reconnection strategy gave up
//! - **Closed**: unsubscribed; terminal, no further transitions
//!
//! ```text
//!           subscribe()
//!              │
//!              ▼
//!      ┌─► Connecting ──fail──► Failed
//!      │       │
//!      │       │ connect ok
//!      │       ▼
//!      │   AwaitAck ──redirect──► Connecting (new host, tried++)
//!      │       │
//!      │       │ ack
//!      │       ▼
//!      │    Active ──disconnect──► Reconnecting ─┘
//!      │       │
//!      │       │ unsubscribe
//!      │       ▼
//!      │    Closed
//! ```

use crate::reconnect::ReconnectionStrategy;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    AwaitAck,
    Active,
    Reconnecting { attempt: u32 },
    Failed,
    Closed,
}

/// Tracks one subscription's logical state and its reconnection strategy.
pub struct ConnectionManager {
    state: Arc<RwLock<ConnectionState>>,
    strategy: Arc<RwLock<Box<dyn ReconnectionStrategy>>>,
    seed_host: String,
}

impl ConnectionManager {
    pub fn new(seed_host: String, strategy: Box<dyn ReconnectionStrategy>) -> Self {
        Self {
            state: Arc::new(RwLock::new(ConnectionState::Connecting)),
            strategy: Arc::new(RwLock::new(strategy)),
            seed_host,
        }
    }

    pub async fn state(&self) -> ConnectionState {
        self.state.read().await.clone()
    }

    pub async fn set_state(&self, new_state: ConnectionState) {
        *self.state.write().await = new_state;
    }

    pub fn seed_host(&self) -> &str {
        &self.seed_host
    }

    pub async fn connecting(&self) {
        self.set_state(ConnectionState::Connecting).await;
    }

    pub async fn await_ack(&self) {
        self.set_state(ConnectionState::AwaitAck).await;
    }

    pub async fn active(&self) {
        self.set_state(ConnectionState::Active).await;
        self.strategy.write().await.reset();
    }

    pub async fn closed(&self) {
        self.set_state(ConnectionState::Closed).await;
    }

    pub async fn start_reconnecting(&self) {
        self.set_state(ConnectionState::Reconnecting { attempt: 0 }).await;
    }

    /// Returns `None` if the strategy has given up, transitioning to `Failed`.
    pub async fn next_reconnect_delay(&self) -> Option<std::time::Duration> {
        let attempt = match self.state().await {
            ConnectionState::Reconnecting { attempt } => attempt,
            _ => 0,
        };

        let delay = self.strategy.write().await.next_delay(attempt);

        if delay.is_some() {
            self.set_state(ConnectionState::Reconnecting { attempt: attempt + 1 }).await;
        } else {
            self.set_state(ConnectionState::Failed).await;
        }

        delay
    }

    pub async fn should_reconnect(&self) -> bool {
        matches!(
            self.state().await,
            ConnectionState::Reconnecting { .. } | ConnectionState::Connecting
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconnect::ExponentialBackoff;
    use std::time::Duration;

    fn manager() -> ConnectionManager {
        let strategy = ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(10));
        ConnectionManager::new("seed:7300:None".to_string(), Box::new(strategy))
    }

    #[tokio::test]
    async fn state_transitions_through_full_lifecycle() {
        let manager = manager();
        assert_eq!(manager.state().await, ConnectionState::Connecting);

        manager.await_ack().await;
        assert_eq!(manager.state().await, ConnectionState::AwaitAck);

        manager.active().await;
        assert_eq!(manager.state().await, ConnectionState::Active);

        manager.closed().await;
        assert_eq!(manager.state().await, ConnectionState::Closed);
    }

    #[tokio::test]
    async fn reconnection_gives_up_after_max_attempts() {
        let strategy = ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(10))
            .with_max_attempts(2);
        let manager = ConnectionManager::new("seed:7300:None".to_string(), Box::new(strategy));

        manager.start_reconnecting().await;
        assert!(manager.next_reconnect_delay().await.is_some());
        assert!(manager.next_reconnect_delay().await.is_some());
        assert!(manager.next_reconnect_delay().await.is_none());
        assert_eq!(manager.state().await, ConnectionState::Failed);
    }

    #[tokio::test]
    async fn strategy_resets_on_active() {
        let manager = manager();
        manager.start_reconnecting().await;
        manager.next_reconnect_delay().await;
        manager.active().await;

        manager.start_reconnecting().await;
        assert_eq!(manager.state().await, ConnectionState::Reconnecting { attempt: 0 });
    }
}
