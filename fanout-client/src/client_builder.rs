//! Composition root for [`crate::Client`].
//!
//! Mirrors the broker's `BrokerBuilder::build()` shape: gather configuration,
//! optionally initialize observability, and hand back an assembled,
//! ready-to-use value. Unlike a WebSocket client that dials eagerly,
//! connecting here happens per subscription (and lazily per host for
//! publish/unsubscribe), so `build()` does no I/O and is not async.
//!
//! # Examples
//!
//! ```rust,no_run
//! use fanout_client::{ClientBuilder, ExponentialBackoff};
//!
//! let client = ClientBuilder::new("127.0.0.1:7300")
//!     .with_reconnect(|| Box::new(ExponentialBackoff::default()))
//!     .max_redirects(5)
//!     .build()
//!     .unwrap();
//! ```

use crate::client::Client;
use crate::reconnect::{ExponentialBackoff, ReconnectionStrategy};
use fanout_core::{Error, HostAddr, Result};
use std::sync::Arc;
use std::time::Duration;

/// Produces a fresh strategy instance for each new session; strategies carry
/// per-session attempt counters so they cannot be shared across sessions.
pub type StrategyFactory = Arc<dyn Fn() -> Box<dyn ReconnectionStrategy> + Send + Sync>;

const DEFAULT_MAX_REDIRECTS: usize = 5;
const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Builder for configuring and creating a [`Client`].
pub struct ClientBuilder {
    seed_host: String,
    strategy_factory: StrategyFactory,
    max_redirects: usize,
    ack_timeout: Duration,
    observability_config: Option<fanout_core::ObservabilityConfig>,
    service_name: Option<String>,
}

impl ClientBuilder {
    /// Create a new client builder seeded with an initial host to contact
    /// for any topic not yet in the host cache. Accepts `host:port` or
    /// `host:port:ssl_port`.
    pub fn new(seed_host: impl Into<String>) -> Self {
        Self {
            seed_host: seed_host.into(),
            strategy_factory: Arc::new(|| Box::new(ExponentialBackoff::default())),
            max_redirects: DEFAULT_MAX_REDIRECTS,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            observability_config: None,
            service_name: None,
        }
    }

    /// Supply a factory producing a fresh reconnection strategy for each
    /// new subscription.
    pub fn with_reconnect<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Box<dyn ReconnectionStrategy> + Send + Sync + 'static,
    {
        self.strategy_factory = Arc::new(factory);
        self
    }

    /// Maximum number of `NOT_RESPONSIBLE_FOR_TOPIC` redirects to follow
    /// before giving up on a subscribe/publish/unsubscribe.
    pub fn max_redirects(mut self, max_redirects: usize) -> Self {
        self.max_redirects = max_redirects;
        self
    }

    /// Timeout for the initial connect and request/ack round trip.
    pub fn ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    /// Enable OpenTelemetry observability with custom configuration.
    pub fn with_observability(mut self, config: fanout_core::ObservabilityConfig) -> Self {
        self.observability_config = Some(config);
        self
    }

    /// Enable OpenTelemetry observability with default configuration.
    pub fn with_default_observability(mut self) -> Self {
        self.observability_config = Some(fanout_core::ObservabilityConfig::default());
        self
    }

    /// Set service name for observability (used if observability is enabled).
    pub fn service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = Some(name.into());
        self
    }

    /// Assemble the client. Fails only if the seed host cannot be parsed or
    /// observability initialization fails.
    pub fn build(self) -> Result<Client> {
        let seed_host = HostAddr::parse(&self.seed_host)
            .ok_or_else(|| Error::CouldNotConnect(self.seed_host.clone()))?;

        let metrics = if let Some(mut config) = self.observability_config {
            if let Some(name) = self.service_name {
                config.service_name = name;
            }
            fanout_core::init_observability(config.clone())
                .map_err(|e| Error::CouldNotConnect(format!("observability init failed: {e}")))?;
            Some(Arc::new(crate::ClientMetrics::new(&config.service_name)))
        } else {
            None
        };

        Ok(Client::new(
            seed_host,
            self.strategy_factory,
            self.max_redirects,
            self.ack_timeout,
            metrics,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconnect::FixedDelay;

    #[test]
    fn builder_defaults() {
        let client = ClientBuilder::new("127.0.0.1:7300").build().unwrap();
        assert_eq!(client.max_redirects(), DEFAULT_MAX_REDIRECTS);
    }

    #[test]
    fn builder_rejects_unparseable_seed_host() {
        let err = ClientBuilder::new("").build();
        assert!(err.is_err());
    }

    #[test]
    fn builder_custom_reconnect_and_redirects() {
        let client = ClientBuilder::new("127.0.0.1:7300")
            .with_reconnect(|| Box::new(FixedDelay::new(Duration::from_millis(50)).with_max_attempts(3)))
            .max_redirects(2)
            .build()
            .unwrap();
        assert_eq!(client.max_redirects(), 2);
    }
}
