use std::time::Duration;

/// Settings for the server worker.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// OS thread name of the worker.
    pub worker_name: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            worker_name: "voxel-server".to_owned(),
        }
    }
}

/// Settings for the main-thread side of the relay.
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    /// Upper bound on [`crate::ClientLink::request`]. `None` waits forever.
    pub request_timeout: Option<Duration>,
}

impl ClientConfig {
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }
}
