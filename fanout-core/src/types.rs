//! Wire types for the pub/sub protocol
//!
//! These mirror the request/response union described by the system's external
//! interface: a small, closed set of operations (publish, subscribe, unsubscribe,
//! consume) multiplexed over a single frame type in each direction, correlated by
//! a client-chosen transaction id.
//!
//! # Message shapes
//!
//! `PubSubRequest` carries one of four typed payloads selected by `operation`.
//! `PubSubResponse` carries a `StatusCode` plus an optional typed body; routing
//! failures carry their detail in `status_msg` rather than a separate error type,
//! matching how redirects encode the new owner's address.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Current wire protocol version understood by this crate.
pub const PROTOCOL_VERSION: u32 = 1;

/// Opaque topic name. Topics are treated as byte strings; this crate requires
/// valid UTF-8 since every transport and storage layer here is text-safe, but
/// no semantic meaning is attached to the contents.
pub type Topic = String;

/// Client-chosen identifier correlating a request with its response(s).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TxnId(pub u64);

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotone per-topic sequence id assigned by the owning node at publish time.
///
/// A cross-region deployment could extend this to a vector of (region, seq)
/// pairs for cross-region ordering; this crate tracks only the local
/// component, which is what the core invariants (monotone, gap-free, FIFO)
/// are stated over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SeqId(pub u64);

impl SeqId {
    pub const ZERO: SeqId = SeqId(0);

    pub fn next(self) -> SeqId {
        SeqId(self.0 + 1)
    }
}

impl fmt::Display for SeqId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Reserved prefix marking a subscriber id as a hub (cross-region importer)
/// rather than a local subscriber. See `SubscriberId::is_hub`.
pub const HUB_SUBSCRIBER_PREFIX: &str = "hub:";

/// Opaque, caller-chosen subscriber identity. Shared across reconnects; the
/// sole key under which a persistent consume pointer is tracked.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriberId(pub String);

impl SubscriberId {
    /// Hub subscribers carry the reserved prefix; local subscribers must not.
    pub fn is_hub(&self) -> bool {
        self.0.starts_with(HUB_SUBSCRIBER_PREFIX)
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SubscriberId {
    fn from(s: &str) -> Self {
        SubscriberId(s.to_string())
    }
}

impl From<String> for SubscriberId {
    fn from(s: String) -> Self {
        SubscriberId(s)
    }
}

/// Unique key identifying a subscription: a subscriber on a topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TopicSubscriber {
    pub topic: Topic,
    pub subscriber_id: SubscriberId,
}

impl TopicSubscriber {
    pub fn new(topic: impl Into<Topic>, subscriber_id: impl Into<SubscriberId>) -> Self {
        Self {
            topic: topic.into(),
            subscriber_id: subscriber_id.into(),
        }
    }
}

/// A single published message as stored and delivered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub seq_id: SeqId,
    pub payload: Vec<u8>,
}

/// Subscribe semantics for an existing-or-absent subscription record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscribeMode {
    /// Fail with `AlreadySubscribed` if a record already exists.
    Create,
    /// Fail with `NotSubscribed` if no record exists; never creates one.
    Attach,
    /// Return the existing record if present, otherwise create one.
    CreateOrAttach,
}

/// Per-subscriber preferences carried on subscribe and merged on re-subscribe.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubscriptionPreferences {
    /// Max undelivered messages to retain on this subscriber's account; `None`
    /// means unbounded.
    pub message_bound: Option<u64>,
    /// Name of a user-supplied filter class to install in the delivery
    /// session's filter chain, resolved by the broker at subscribe time.
    pub message_filter: Option<String>,
    /// Opaque caller options, passed through unexamined by the core.
    pub options: std::collections::HashMap<String, String>,
}

impl SubscriptionPreferences {
    /// Merge `other` into `self`, preferring `other`'s values where present.
    pub fn merge(&mut self, other: SubscriptionPreferences) {
        if other.message_bound.is_some() {
            self.message_bound = other.message_bound;
        }
        if other.message_filter.is_some() {
            self.message_filter = other.message_filter;
        }
        self.options.extend(other.options);
    }
}

/// Persisted subscription record: the part of `SubscriptionState` that survives
/// a process restart.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubscriptionData {
    pub last_consumed: Option<SeqId>,
    pub preferences: SubscriptionPreferences,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishRequest {
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscribeRequest {
    pub subscriber_id: SubscriberId,
    pub mode: SubscribeMode,
    /// If true, listener notifications fired as part of this subscribe
    /// (first-local-subscribe) are awaited synchronously before acking.
    pub synchronous: bool,
    /// If true, evicts any existing session for this TopicSubscriber instead
    /// of failing with `TopicBusy`.
    pub force_attach: bool,
    pub preferences: SubscriptionPreferences,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnsubscribeRequest {
    pub subscriber_id: SubscriberId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumeRequest {
    pub subscriber_id: SubscriberId,
    pub seq_id: SeqId,
}

/// The operation-specific payload of a `PubSubRequest`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RequestBody {
    Publish(PublishRequest),
    Subscribe(SubscribeRequest),
    Unsubscribe(UnsubscribeRequest),
    Consume(ConsumeRequest),
}

impl RequestBody {
    pub fn operation_name(&self) -> &'static str {
        match self {
            RequestBody::Publish(_) => "PUBLISH",
            RequestBody::Subscribe(_) => "SUBSCRIBE",
            RequestBody::Unsubscribe(_) => "UNSUBSCRIBE",
            RequestBody::Consume(_) => "CONSUME",
        }
    }

    /// `CONSUME` is fire-and-forget: no response frame is ever written for it.
    pub fn expects_response(&self) -> bool {
        !matches!(self, RequestBody::Consume(_))
    }
}

/// A request frame in the single request/response union.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PubSubRequest {
    pub protocol_version: u32,
    pub topic: Topic,
    pub txn_id: TxnId,
    /// Set when the client has been redirected and wants this node to claim
    /// ownership of the topic if it does not already hold it (best-effort hint,
    /// not a command the node is obligated to honor on its own schedule).
    pub should_claim: bool,
    /// Servers already tried while chasing a redirect chain for this request.
    pub tried_servers: Vec<String>,
    pub body: RequestBody,
}

impl PubSubRequest {
    pub fn new(topic: impl Into<Topic>, txn_id: TxnId, body: RequestBody) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            topic: topic.into(),
            txn_id,
            should_claim: false,
            tried_servers: Vec::new(),
            body,
        }
    }
}

/// Status codes used by the core, per the wire contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusCode {
    Success,
    /// `status_msg` carries `host:port:sslPort` of the intended owner.
    NotResponsibleForTopic,
    ClientAlreadySubscribed,
    ClientNotSubscribed,
    TopicBusy,
    ServiceDown,
    MalformedRequest,
    UncertainState,
    InvalidMessageFilter,
    InvalidSubscriberId,
}

impl StatusCode {
    pub fn is_success(self) -> bool {
        matches!(self, StatusCode::Success)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishResponseBody {
    pub seq_id: SeqId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscribeResponseBody {
    /// The seq id the subscriber should start consuming after: delivery
    /// begins at `last_consumed + 1`.
    pub last_consumed: Option<SeqId>,
}

/// A delivered message, pushed asynchronously on a subscribe channel after
/// the subscribe ack. Distinguished from request/response traffic by the
/// enclosing `ServerFrame`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveredMessage {
    pub topic: Topic,
    pub message: Message,
}

/// The operation-specific payload of a `PubSubResponse`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ResponseBody {
    None,
    Publish(PublishResponseBody),
    Subscribe(SubscribeResponseBody),
}

/// A response frame in the single request/response union.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PubSubResponse {
    pub protocol_version: u32,
    pub status_code: StatusCode,
    pub status_msg: String,
    pub txn_id: TxnId,
    pub body: ResponseBody,
}

impl PubSubResponse {
    pub fn success(txn_id: TxnId, body: ResponseBody) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            status_code: StatusCode::Success,
            status_msg: String::new(),
            txn_id,
            body,
        }
    }

    pub fn error(txn_id: TxnId, status_code: StatusCode, status_msg: impl Into<String>) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            status_code,
            status_msg: status_msg.into(),
            txn_id,
            body: ResponseBody::None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status_code.is_success()
    }
}

/// Anything that can arrive on a subscribe channel: the ack/response stream,
/// or an asynchronously delivered message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ServerFrame {
    Response(PubSubResponse),
    Delivery(DeliveredMessage),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hub_subscriber_prefix_detection() {
        let hub: SubscriberId = "hub:region-b".into();
        let local: SubscriberId = "alice".into();
        assert!(hub.is_hub());
        assert!(!local.is_hub());
    }

    #[test]
    fn seq_id_ordering_and_next() {
        let a = SeqId(5);
        assert!(a.next() > a);
        assert_eq!(a.next(), SeqId(6));
    }

    #[test]
    fn preferences_merge_prefers_new_values() {
        let mut base = SubscriptionPreferences {
            message_bound: Some(10),
            message_filter: None,
            options: Default::default(),
        };
        base.merge(SubscriptionPreferences {
            message_bound: Some(20),
            message_filter: Some("custom".into()),
            options: Default::default(),
        });
        assert_eq!(base.message_bound, Some(20));
        assert_eq!(base.message_filter.as_deref(), Some("custom"));
    }

    #[test]
    fn consume_request_is_fire_and_forget() {
        let body = RequestBody::Consume(ConsumeRequest {
            subscriber_id: "alice".into(),
            seq_id: SeqId(1),
        });
        assert!(!body.expects_response());
    }
}
