//! Error types for the pub/sub core
//!
//! Two layers, mirroring the wire contract: `Error` is the internal,
//! rich-context error used throughout these crates; `StatusCode` (in
//! `types.rs`) plus a status message is the wire-format projection, produced
//! only at the RequestRouter boundary via `Error::to_status`.

use crate::types::StatusCode;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The owner hint carried by a `NOT_RESPONSIBLE_FOR_TOPIC` response.
    #[error("not responsible for topic, owner hint: {0}")]
    NotResponsibleForTopic(String),

    #[error("too many redirects chasing topic {topic} (tried {tried})")]
    TooManyRedirects { topic: String, tried: usize },

    #[error("redirect loop detected for topic {topic}: {host} already tried")]
    RedirectLoop { topic: String, host: String },

    #[error("subscriber already subscribed")]
    AlreadySubscribed,

    #[error("subscriber not subscribed")]
    NotSubscribed,

    #[error("topic busy: an active session already exists for this subscriber")]
    TopicBusy,

    #[error("invalid subscriber id: {0}")]
    InvalidSubscriberId(String),

    #[error("invalid message filter: {0}")]
    InvalidMessageFilter(String),

    #[error("could not connect: {0}")]
    CouldNotConnect(String),

    #[error("uncertain state: request outcome unknown after channel loss")]
    UncertainState,

    #[error("service down: {0}")]
    ServiceDown(String),

    #[error("server not ready: topic acquisition in progress")]
    ServerNotReady,

    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("request timed out")]
    Timeout,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Project an internal error onto the wire `(StatusCode, statusMsg)` pair.
    /// Routing errors are surfaced to the caller as `ServiceDown` with cause
    /// per the propagation policy; everything else is surfaced verbatim.
    pub fn to_status(&self) -> (StatusCode, String) {
        match self {
            Error::NotResponsibleForTopic(owner) => {
                (StatusCode::NotResponsibleForTopic, owner.clone())
            }
            Error::TooManyRedirects { .. } | Error::RedirectLoop { .. } => {
                (StatusCode::ServiceDown, self.to_string())
            }
            Error::AlreadySubscribed => (StatusCode::ClientAlreadySubscribed, self.to_string()),
            Error::NotSubscribed => (StatusCode::ClientNotSubscribed, self.to_string()),
            Error::TopicBusy => (StatusCode::TopicBusy, self.to_string()),
            Error::InvalidSubscriberId(_) => {
                (StatusCode::InvalidSubscriberId, self.to_string())
            }
            Error::InvalidMessageFilter(_) => {
                (StatusCode::InvalidMessageFilter, self.to_string())
            }
            Error::MalformedRequest(_) => (StatusCode::MalformedRequest, self.to_string()),
            Error::UncertainState => (StatusCode::UncertainState, self.to_string()),
            Error::CouldNotConnect(_)
            | Error::ServiceDown(_)
            | Error::ServerNotReady
            | Error::Storage(_)
            | Error::Serialization(_)
            | Error::Io(_)
            | Error::Timeout
            | Error::ConnectionClosed
            | Error::Internal(_) => (StatusCode::ServiceDown, self.to_string()),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_errors_surface_as_service_down() {
        let e = Error::RedirectLoop {
            topic: "x".into(),
            host: "b".into(),
        };
        let (code, msg) = e.to_status();
        assert_eq!(code, StatusCode::ServiceDown);
        assert!(msg.contains("redirect loop"));
    }

    #[test]
    fn not_responsible_carries_owner_hint_verbatim() {
        let e = Error::NotResponsibleForTopic("hostB:4080:4081".into());
        let (code, msg) = e.to_status();
        assert_eq!(code, StatusCode::NotResponsibleForTopic);
        assert_eq!(msg, "hostB:4080:4081");
    }

    #[test]
    fn subscription_errors_surface_verbatim() {
        assert_eq!(
            Error::AlreadySubscribed.to_status().0,
            StatusCode::ClientAlreadySubscribed
        );
        assert_eq!(
            Error::TopicBusy.to_status().0,
            StatusCode::TopicBusy
        );
    }
}
