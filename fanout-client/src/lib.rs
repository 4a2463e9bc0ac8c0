//! Client library for the topic-partitioned pub/sub broker.
//!
//! Talks the same `PubSubRequest`/`ServerFrame` wire protocol as the broker
//! over plain TCP or TLS, follows `NOT_RESPONSIBLE_FOR_TOPIC` redirects to
//! find a topic's current owner, and reconnects subscriptions transparently
//! across disconnects.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use fanout_client::{Client, SubscribeMode, SubscriptionPreferences};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::builder("127.0.0.1:7300").build()?;
//!
//!     let session = client
//!         .subscribe(
//!             "events",
//!             "alice",
//!             SubscribeMode::CreateOrAttach,
//!             false,
//!             SubscriptionPreferences::default(),
//!             |msg| println!("delivered: {:?}", msg),
//!         )
//!         .await?;
//!
//!     client.publish("events", b"hello".to_vec()).await?;
//!
//!     session.unsubscribe(std::time::Duration::from_secs(5)).await?;
//!     Ok(())
//! }
//! ```
//!
//! # With Reconnection
//!
//! ```rust,no_run
//! use fanout_client::{Client, ExponentialBackoff};
//! use std::time::Duration;
//!
//! let client = Client::builder("127.0.0.1:7300")
//!     .with_reconnect(|| {
//!         Box::new(
//!             ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(30))
//!                 .with_max_attempts(10)
//!                 .with_jitter(),
//!         )
//!     })
//!     .build()
//!     .unwrap();
//! ```

mod channel;
mod client;
mod client_builder;
mod connection_state;
mod metrics;
mod reconnect;
mod session;

pub use channel::RequestChannel;
pub use client::Client;
pub use client_builder::{ClientBuilder, StrategyFactory};
pub use connection_state::{ConnectionManager, ConnectionState};
pub use metrics::ClientMetrics;
pub use reconnect::{ExponentialBackoff, FixedDelay, NoReconnect, ReconnectionStrategy};
pub use session::{ClientSession, HostCache};

pub use fanout_core::{
    DeliveredMessage, Error, HostAddr, Result, SubscribeMode, SubscriptionPreferences,
};
