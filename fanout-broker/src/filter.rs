//! Delivery-time message filtering.
//!
//! Every delivery session installs an always-present identity filter
//! (`AllToAllTopology`) plus, when the subscriber's preferences name one, a
//! user-supplied `MessageFilter` resolved by class name. Unlike the topic-level
//! pattern matching this superseded, a filter here inspects message content
//! after a subscriber is already attached to a topic; it decides whether an
//! individual message is delivered, not which topics a subscriber hears from.

use fanout_core::{Error, Message, Result};
use std::collections::HashMap;
use std::sync::Arc;

/// Inspects a message for a given subscriber and decides whether to deliver it.
pub trait MessageFilter: Send + Sync {
    fn admits(&self, message: &Message) -> bool;
}

/// The default filter installed on every delivery session: admits everything.
#[derive(Debug, Default)]
pub struct AllToAllTopology;

impl MessageFilter for AllToAllTopology {
    fn admits(&self, _message: &Message) -> bool {
        true
    }
}

type FilterFactory = Arc<dyn Fn() -> Box<dyn MessageFilter> + Send + Sync>;

/// Registry of named filter classes, resolved at subscribe time from
/// `SubscriptionPreferences.message_filter`. A broker deployment registers its
/// available classes up front; class names absent from the registry fail
/// subscribe with `InvalidMessageFilter`.
#[derive(Clone, Default)]
pub struct FilterRegistry {
    factories: HashMap<String, FilterFactory>,
}

impl FilterRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        factory: impl Fn() -> Box<dyn MessageFilter> + Send + Sync + 'static,
    ) {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    /// Build the filter chain for a subscribe request: the identity filter
    /// always first, followed by the named class if one was requested.
    pub fn build_chain(&self, class_name: Option<&str>) -> Result<Vec<Box<dyn MessageFilter>>> {
        let mut chain: Vec<Box<dyn MessageFilter>> = vec![Box::new(AllToAllTopology)];
        if let Some(name) = class_name {
            let factory = self
                .factories
                .get(name)
                .ok_or_else(|| Error::InvalidMessageFilter(name.to_string()))?;
            chain.push(factory());
        }
        Ok(chain)
    }
}

pub fn admits_all(chain: &[Box<dyn MessageFilter>], message: &Message) -> bool {
    chain.iter().all(|f| f.admits(message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use fanout_core::SeqId;

    struct EvenPayloadLen;
    impl MessageFilter for EvenPayloadLen {
        fn admits(&self, message: &Message) -> bool {
            message.payload.len() % 2 == 0
        }
    }

    fn msg(payload: &[u8]) -> Message {
        Message {
            seq_id: SeqId(1),
            payload: payload.to_vec(),
        }
    }

    #[test]
    fn identity_filter_admits_everything() {
        let registry = FilterRegistry::new();
        let chain = registry.build_chain(None).unwrap();
        assert!(admits_all(&chain, &msg(b"anything")));
    }

    #[test]
    fn unregistered_class_name_is_rejected() {
        let registry = FilterRegistry::new();
        let err = registry.build_chain(Some("nope")).unwrap_err();
        assert!(matches!(err, Error::InvalidMessageFilter(_)));
    }

    #[test]
    fn registered_class_is_applied_after_identity_filter() {
        let mut registry = FilterRegistry::new();
        registry.register("even_len", || Box::new(EvenPayloadLen));

        let chain = registry.build_chain(Some("even_len")).unwrap();
        assert_eq!(chain.len(), 2);
        assert!(admits_all(&chain, &msg(b"ab")));
        assert!(!admits_all(&chain, &msg(b"abc")));
    }
}
