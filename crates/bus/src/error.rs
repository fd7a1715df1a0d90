use std::fmt;

/// Errors from the event bus.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("event type '{0}' is not registered")]
    Unregistered(String),

    #[error("event type '{0}' is already registered")]
    AlreadyRegistered(String),

    #[error("'{0}' is reserved and cannot be registered as an event type")]
    ReservedType(String),

    #[error("codec error for event '{event_type}': {source}")]
    Codec {
        event_type: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("event bus dropped while waiting for '{0}'")]
    Closed(&'static str),

    #[error("reply '{0}' was canceled before it reached its waiter")]
    ReplyNotObserved(&'static str),

    #[error("handler failed: {0}")]
    Handler(String),
}

impl BusError {
    /// Wrap a consumer-side failure raised inside a handler.
    pub fn handler(err: impl fmt::Display) -> Self {
        Self::Handler(err.to_string())
    }
}
