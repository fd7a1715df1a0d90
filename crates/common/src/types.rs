use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// The logical side of the game an event or bus instance belongs to.
///
/// Both sides run in one process; the client on the main thread, the server
/// on a background worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Environment {
    Client,
    Server,
}

impl Environment {
    /// Prefix used to namespace event type names, e.g. `"Client"` in `"Client.Ping"`.
    pub fn namespace(self) -> &'static str {
        match self {
            Self::Client => "Client",
            Self::Server => "Server",
        }
    }

    /// The environment on the other side of the worker boundary.
    pub fn peer(self) -> Self {
        match self {
            Self::Client => Self::Server,
            Self::Server => Self::Client,
        }
    }

    /// Whether `event_type` is namespaced under this environment.
    pub fn owns(self, event_type: &str) -> bool {
        event_type
            .strip_prefix(self.namespace())
            .is_some_and(|rest| rest.starts_with('.'))
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.namespace())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown environment '{0}', expected 'Client' or 'Server'")]
pub struct ParseEnvironmentError(String);

impl FromStr for Environment {
    type Err = ParseEnvironmentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Client" | "client" => Ok(Self::Client),
            "Server" | "server" => Ok(Self::Server),
            other => Err(ParseEnvironmentError(other.to_owned())),
        }
    }
}

/// Opaque token pairing a request event with its eventual response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(pub Uuid);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Milliseconds since the Unix epoch. Used for event timestamps.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
