//! Topic-partitioned pub/sub broker node.
//!
//! A broker node owns a subset of topics at any given time, tracked through
//! the [`ownership`] registry shared by every node in the cluster via a
//! common metadata store. Clients may publish, subscribe, unsubscribe, and
//! consume through either the plaintext or TLS listener; requests for a
//! topic this node doesn't own come back as a redirect to whichever node
//! currently holds it, optionally claiming it first if the client allows it.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use fanout_broker::Broker;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let broker = Broker::builder()
//!         .bind_plaintext("127.0.0.1:7300")
//!         .metadata_store("./data/meta")
//!         .message_log("./data/log")
//!         .build()
//!         .await?;
//!
//!     broker.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! - **Listener tasks** accept connections and run one request loop per
//!   connection, reading `PubSubRequest` frames and writing back
//!   `PubSubResponse`/`DeliveredMessage` frames.
//! - **Request router** dispatches each request to the ownership registry
//!   (for the owner check), persistence gateway (append/scan), and
//!   subscription manager (subscribe/unsubscribe/consume bookkeeping).
//! - **Delivery sessions** run independently of request handling, one per
//!   subscribed `(topic, subscriber)` pair, scanning the durable log forward
//!   and pushing admitted messages onto the connection's outbound channel.
//! - **Background tasks** refresh this node's ownership leases, watch for
//!   externally vanished leases, and periodically recompute consumed-until
//!   and message-bound hints for owned topics.

mod builder;
mod delivery;
mod filter;
mod gc_task;
mod listener;
mod metrics;
mod ownership;
mod persistence;
mod router;
mod subscription;

pub use builder::BrokerBuilder;
pub use delivery::DeliveryManager;
pub use filter::{AllToAllTopology, FilterRegistry, MessageFilter};
pub use metrics::BrokerMetrics;
pub use ownership::{ClaimOutcome, OwnershipRegistry};
pub use persistence::PersistenceGateway;
pub use router::RequestRouter;
pub use subscription::SubscriptionManager;

use fanout_core::Result;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio_rustls::TlsAcceptor;

/// A running broker node.
///
/// Built via [`Broker::builder`]. Call [`Broker::run`] to accept connections;
/// it runs until the process is terminated.
pub struct Broker {
    plaintext_listener: TcpListener,
    tls: Option<(TcpListener, TlsAcceptor)>,
    router: Arc<RequestRouter>,
    ownership: Arc<OwnershipRegistry>,
    persistence: Arc<PersistenceGateway>,
    subscriptions: Arc<SubscriptionManager>,
    delivery: Arc<DeliveryManager>,
    metrics: Option<Arc<BrokerMetrics>>,
    heartbeat_shutdown_tx: watch::Sender<bool>,
    watcher_shutdown_tx: watch::Sender<bool>,
    gc_shutdown_tx: watch::Sender<bool>,
}

impl Broker {
    pub fn builder() -> BrokerBuilder {
        BrokerBuilder::new()
    }

    /// Run the accept loops for the plaintext and (if configured) TLS
    /// listeners. Runs until both loops exit, which in practice means until
    /// the process is terminated.
    pub async fn run(&self) -> Result<()> {
        tracing::info!("broker accepting connections");

        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let plaintext = listener::run_plaintext_acceptor(
            &self.plaintext_listener,
            self.router.clone(),
            shutdown_rx.clone(),
        );

        match &self.tls {
            Some((tls_listener, acceptor)) => {
                let tls = listener::run_tls_acceptor(
                    tls_listener,
                    acceptor.clone(),
                    self.router.clone(),
                    shutdown_rx,
                );
                tokio::join!(plaintext, tls);
            }
            None => plaintext.await,
        }

        Ok(())
    }

    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.plaintext_listener.local_addr()
    }

    pub fn ownership(&self) -> &Arc<OwnershipRegistry> {
        &self.ownership
    }

    pub fn persistence(&self) -> &Arc<PersistenceGateway> {
        &self.persistence
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionManager> {
        &self.subscriptions
    }

    pub fn delivery(&self) -> &Arc<DeliveryManager> {
        &self.delivery
    }

    pub fn metrics(&self) -> Option<&Arc<BrokerMetrics>> {
        self.metrics.as_ref()
    }
}

impl Drop for Broker {
    /// Signals the heartbeat, watcher, and GC background tasks to stop.
    /// Active connections are dropped along with the listeners; for a clean
    /// shutdown, stop accepting new work before dropping the broker.
    fn drop(&mut self) {
        let _ = self.heartbeat_shutdown_tx.send(true);
        let _ = self.watcher_shutdown_tx.send(true);
        let _ = self.gc_shutdown_tx.send(true);
    }
}

/// Reacts to ownership leases vanishing out from under this node (expiry, a
/// peer stealing a stale lease, or external deletion) by dropping local
/// subscriber tracking for that topic, so a later claim starts clean instead
/// of serving stale subscriber state for a topic this node no longer owns.
async fn release_listener(
    subscriptions: Arc<SubscriptionManager>,
    delivery: Arc<DeliveryManager>,
    mut released_rx: mpsc::UnboundedReceiver<String>,
) {
    while let Some(topic) = released_rx.recv().await {
        tracing::info!(topic = %topic, "ownership lease lost, releasing local subscriber state");
        delivery.terminate_topic(&topic).await;
        subscriptions.release_topic(&topic).await;
    }
}
