//! Builder for constructing a [`Broker`](crate::Broker).
//!
//! A fluent builder: plain fields set by consuming setters, a `build()` that
//! does the actual I/O (binding listeners, opening storage, initializing
//! observability, spawning background tasks) and hands back the assembled
//! type.

use crate::delivery::DeliveryManager;
use crate::filter::{FilterRegistry, MessageFilter};
use crate::gc_task;
use crate::metrics::BrokerMetrics;
use crate::ownership::OwnershipRegistry;
use crate::persistence::PersistenceGateway;
use crate::router::RequestRouter;
use crate::subscription::SubscriptionListener;
use crate::Broker;
use fanout_core::{Error, HostAddr, ObservabilityConfig, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_rustls::rustls;
use tokio_rustls::TlsAcceptor;

pub struct BrokerBuilder {
    plaintext_addr: Option<String>,
    tls_addr: Option<String>,
    tls_cert_path: Option<PathBuf>,
    tls_key_path: Option<PathBuf>,
    node_host: Option<String>,
    metadata_store_path: Option<PathBuf>,
    message_log_path: Option<PathBuf>,
    filters: FilterRegistry,
    observability_config: Option<ObservabilityConfig>,
    service_name: Option<String>,
    lease_ttl: Duration,
    consume_interval: u64,
    gc_interval: Duration,
    backpressure_timeout: Duration,
    first_local_listeners: Vec<SubscriptionListener>,
    last_local_listeners: Vec<SubscriptionListener>,
}

impl BrokerBuilder {
    pub fn new() -> Self {
        Self {
            plaintext_addr: None,
            tls_addr: None,
            tls_cert_path: None,
            tls_key_path: None,
            node_host: None,
            metadata_store_path: None,
            message_log_path: None,
            filters: FilterRegistry::new(),
            observability_config: None,
            service_name: None,
            lease_ttl: Duration::from_secs(30),
            consume_interval: 20,
            gc_interval: Duration::from_secs(30),
            backpressure_timeout: Duration::from_secs(10),
            first_local_listeners: Vec::new(),
            last_local_listeners: Vec::new(),
        }
    }

    pub fn bind_plaintext(mut self, addr: impl Into<String>) -> Self {
        self.plaintext_addr = Some(addr.into());
        self
    }

    pub fn bind_tls(
        mut self,
        addr: impl Into<String>,
        cert_path: impl Into<PathBuf>,
        key_path: impl Into<PathBuf>,
    ) -> Self {
        self.tls_addr = Some(addr.into());
        self.tls_cert_path = Some(cert_path.into());
        self.tls_key_path = Some(key_path.into());
        self
    }

    /// Host advertised to redirected clients. Defaults to the plaintext bind
    /// address's host component if unset.
    pub fn node_host(mut self, host: impl Into<String>) -> Self {
        self.node_host = Some(host.into());
        self
    }

    pub fn metadata_store(mut self, path: impl Into<PathBuf>) -> Self {
        self.metadata_store_path = Some(path.into());
        self
    }

    pub fn message_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.message_log_path = Some(path.into());
        self
    }

    pub fn register_filter(
        mut self,
        name: impl Into<String>,
        factory: impl Fn() -> Box<dyn MessageFilter> + Send + Sync + 'static,
    ) -> Self {
        self.filters.register(name, factory);
        self
    }

    pub fn with_observability(mut self, config: ObservabilityConfig) -> Self {
        self.observability_config = Some(config);
        self
    }

    pub fn with_default_observability(mut self) -> Self {
        self.observability_config = Some(ObservabilityConfig::default());
        self
    }

    pub fn service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = Some(name.into());
        self
    }

    pub fn ownership_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    /// Number of consumes accumulated before a subscriber's consume pointer
    /// is written to durable storage.
    pub fn consume_interval(mut self, n: u64) -> Self {
        self.consume_interval = n;
        self
    }

    pub fn gc_interval(mut self, interval: Duration) -> Self {
        self.gc_interval = interval;
        self
    }

    pub fn backpressure_timeout(mut self, timeout: Duration) -> Self {
        self.backpressure_timeout = timeout;
        self
    }

    /// Register a cross-region federation hook fired when a topic gains its
    /// first local subscriber on this node, either via a fresh subscribe or
    /// on reacquiring a topic whose persisted records already had one.
    pub fn on_first_local_subscribe(mut self, listener: SubscriptionListener) -> Self {
        self.first_local_listeners.push(listener);
        self
    }

    /// Register a cross-region federation hook fired when a topic loses its
    /// last local subscriber on this node, either via unsubscribe or topic
    /// release.
    pub fn on_last_local_unsubscribe(mut self, listener: SubscriptionListener) -> Self {
        self.last_local_listeners.push(listener);
        self
    }

    pub async fn build(self) -> Result<Broker> {
        let plaintext_addr = self
            .plaintext_addr
            .ok_or_else(|| Error::Internal("no plaintext bind address specified".into()))?;
        let plaintext_listener = TcpListener::bind(&plaintext_addr)
            .await
            .map_err(|e| Error::Io(e.to_string()))?;
        let local_plaintext = plaintext_listener.local_addr().map_err(|e| Error::Io(e.to_string()))?;

        let tls = match (&self.tls_addr, &self.tls_cert_path, &self.tls_key_path) {
            (Some(addr), Some(cert_path), Some(key_path)) => {
                let listener = TcpListener::bind(addr).await.map_err(|e| Error::Io(e.to_string()))?;
                let acceptor = build_tls_acceptor(cert_path, key_path)?;
                Some((listener, acceptor))
            }
            _ => None,
        };
        let local_tls_port = tls.as_ref().and_then(|(l, _)| l.local_addr().ok()).map(|a| a.port());

        let metrics = if let Some(mut config) = self.observability_config {
            if let Some(name) = self.service_name {
                config.service_name = name;
            }
            fanout_core::init_observability(config.clone())
                .map_err(|e| Error::Internal(format!("failed to initialize observability: {e}")))?;
            Some(Arc::new(BrokerMetrics::new(&config.service_name)))
        } else {
            None
        };

        let node_host = self
            .node_host
            .unwrap_or_else(|| local_plaintext.ip().to_string());
        let node_id = HostAddr::new(node_host, local_plaintext.port(), local_tls_port);

        let metadata_store_path = self
            .metadata_store_path
            .ok_or_else(|| Error::Internal("no metadata store path specified".into()))?;
        let metadata_db = sled::open(&metadata_store_path).map_err(|e| Error::Storage(e.to_string()))?;
        let ownership = Arc::new(OwnershipRegistry::new(&metadata_db, node_id.clone(), self.lease_ttl)?);

        let message_log_path = self
            .message_log_path
            .ok_or_else(|| Error::Internal("no message log path specified".into()))?;
        let persistence = Arc::new(PersistenceGateway::open(&message_log_path)?);

        let filters = Arc::new(self.filters);
        let subscriptions = Arc::new(crate::subscription::SubscriptionManager::new(
            persistence.clone(),
            filters.clone(),
            self.consume_interval,
        ));
        for listener in self.first_local_listeners {
            subscriptions.on_first_local_subscribe(listener).await;
        }
        for listener in self.last_local_listeners {
            subscriptions.on_last_local_unsubscribe(listener).await;
        }

        let delivery = Arc::new(DeliveryManager::new(
            persistence.clone(),
            subscriptions.clone(),
            self.backpressure_timeout,
        ));
        let router = Arc::new(RequestRouter::new(
            ownership.clone(),
            persistence.clone(),
            subscriptions.clone(),
            delivery.clone(),
        ));

        let (heartbeat_shutdown_tx, heartbeat_shutdown_rx) = tokio::sync::watch::channel(false);
        let (watcher_shutdown_tx, watcher_shutdown_rx) = tokio::sync::watch::channel(false);
        let (gc_shutdown_tx, gc_shutdown_rx) = tokio::sync::watch::channel(false);
        let (released_tx, released_rx) = tokio::sync::mpsc::unbounded_channel();

        tokio::spawn(ownership.clone().run_heartbeat(heartbeat_shutdown_rx));
        tokio::spawn(ownership.clone().run_watcher(released_tx, watcher_shutdown_rx));
        tokio::spawn(crate::release_listener(
            subscriptions.clone(),
            delivery.clone(),
            released_rx,
        ));
        tokio::spawn(gc_task::run_gc_task(
            persistence.clone(),
            subscriptions.clone(),
            self.gc_interval,
            gc_shutdown_rx,
        ));

        tracing::info!(addr = %local_plaintext, "broker listening");

        Ok(Broker {
            plaintext_listener,
            tls,
            router,
            ownership,
            persistence,
            subscriptions,
            delivery,
            metrics,
            heartbeat_shutdown_tx,
            watcher_shutdown_tx,
            gc_shutdown_tx,
        })
    }
}

fn build_tls_acceptor(cert_path: &PathBuf, key_path: &PathBuf) -> Result<TlsAcceptor> {
    let cert_file = std::fs::File::open(cert_path).map_err(|e| Error::Io(e.to_string()))?;
    let mut cert_reader = std::io::BufReader::new(cert_file);
    let certs: Vec<_> = rustls_pemfile::certs(&mut cert_reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Io(e.to_string()))?;

    let key_file = std::fs::File::open(key_path).map_err(|e| Error::Io(e.to_string()))?;
    let mut key_reader = std::io::BufReader::new(key_file);
    let key = rustls_pemfile::private_key(&mut key_reader)
        .map_err(|e| Error::Io(e.to_string()))?
        .ok_or_else(|| Error::Internal("no private key found in key file".into()))?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::Internal(format!("invalid tls configuration: {e}")))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

impl Default for BrokerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
