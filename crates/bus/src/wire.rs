use serde::{Deserialize, Serialize};
use serde_json::Value;
use voxel_common::{CorrelationId, Environment};

/// Structure every event takes when crossing the worker boundary.
///
/// ```text
/// { "type": "Client.Ping",
///   "metadata": { "timestamp": 1700000000000, "correlationId": "…" | null },
///   "payload": <event-specific> }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    #[serde(rename = "type")]
    pub event_type: String,
    pub metadata: WireMetadata,
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMetadata {
    pub timestamp: u64,
    pub correlation_id: Option<CorrelationId>,
    /// Environment the event was first published in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<Environment>,
}
