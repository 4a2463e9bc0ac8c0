//! fanout - topic-partitioned pub/sub broker and client
//!
//! This is the convenience crate that re-exports the broker and client
//! sub-crates under one dependency.
//!
//! # Architecture
//!
//! - **fanout-core**: wire types, codec, error handling, observability
//! - **fanout-broker**: the broker node (ownership, persistence, delivery, routing)
//! - **fanout-client**: the subscriber/publisher client (sessions, redirects, reconnection)
//!
//! # Quick Start - Broker
//!
//! ```rust,no_run
//! use fanout::Broker;
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
//! # Quick Start - Client
//!
//! ```rust,no_run
//! use fanout::{Client, SubscribeMode, SubscriptionPreferences};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::builder("127.0.0.1:7300").build()?;
//!
//!     client
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
//!     Ok(())
//! }
//! ```

pub use fanout_broker as broker;
pub use fanout_client as client;
pub use fanout_core as core;

pub use fanout_broker::Broker;
pub use fanout_client::Client;
pub use fanout_core::{SubscribeMode, SubscriptionPreferences};
