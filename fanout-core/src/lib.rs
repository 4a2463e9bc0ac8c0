//! Core wire types, framing, and error handling for the pub/sub broker.
//!
//! This crate is transport-agnostic: it defines the request/response union,
//! the length-prefixed frame codec, the host-address triplet used in
//! redirects, and the shared error/status vocabulary. `fanout-broker` and
//! `fanout-client` build the owning node and subscriber-side session logic
//! on top of these types.

pub mod codec;
pub mod error;
pub mod observability;
pub mod types;

pub use codec::HostAddr;
pub use error::{Error, Result};
pub use observability::{init_observability, shutdown_observability, ObservabilityConfig};
pub use types::{
    ConsumeRequest, DeliveredMessage, Message, PublishRequest, PublishResponseBody,
    PubSubRequest, PubSubResponse, RequestBody, ResponseBody, SeqId, ServerFrame, SubscribeMode,
    SubscribeRequest, SubscribeResponseBody, SubscriberId, SubscriptionData,
    SubscriptionPreferences, StatusCode, Topic, TopicSubscriber, TxnId, UnsubscribeRequest,
    HUB_SUBSCRIBER_PREFIX, PROTOCOL_VERSION,
};
