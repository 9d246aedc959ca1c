//! Polling endpoint payloads.

use crate::messages::ServerUpdate;
use serde::{Deserialize, Serialize};

/// Query parameters for a poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollRequest {
    /// Stable per-device identifier.
    pub client_id: String,
    /// Watermark: only deltas after this time are wanted. Absent on
    /// a first sync, which asks for everything.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<i64>,
}

/// Answer to a poll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollResponse {
    /// Whether the poll was served.
    pub success: bool,
    /// Deltas since the requested watermark.
    #[serde(default)]
    pub updates: Vec<ServerUpdate>,
    /// True if more deltas remain beyond this batch.
    #[serde(default)]
    pub has_more: bool,
    /// Server time (unix ms); the watermark candidate.
    pub server_time: i64,
    /// Server-suggested next poll interval in milliseconds. The
    /// carrier clamps this to its configured bounds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_interval: Option<u64>,
}

impl PollResponse {
    /// An empty successful poll.
    pub fn empty(server_time: i64) -> Self {
        Self {
            success: true,
            updates: Vec::new(),
            has_more: false,
            server_time,
            suggested_interval: None,
        }
    }
}
