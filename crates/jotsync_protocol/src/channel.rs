//! Duplex-channel message union.

use crate::conflict::ConflictRecord;
use crate::messages::{ServerUpdate, SyncRequest, SyncResponse};
use serde::{Deserialize, Serialize};

/// A frame on the persistent duplex channel.
///
/// Tagged by a `type` field on the wire. Deserialization is
/// exhaustive: a frame with an unknown tag fails to decode instead of
/// falling through, so protocol drift is caught at the boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelMessage {
    /// Client → server: authentication handshake, sent once after the
    /// socket opens. Answered by `ack` or `error` within the auth
    /// timeout.
    Auth {
        /// Stable per-device identifier.
        client_id: String,
        /// Session credential.
        token: String,
    },
    /// Client → server: a sync request.
    Sync {
        /// The request; its `request_id` correlates the response.
        request: SyncRequest,
    },
    /// Server → client: answer to a `sync` frame.
    SyncResponse {
        /// The `request_id` of the request being answered.
        request_id: String,
        /// The response body.
        response: SyncResponse,
    },
    /// Liveness probe, either direction.
    Ping {
        /// Echo token.
        seq: u64,
    },
    /// Answer to a `ping`.
    Pong {
        /// Echo token from the ping.
        seq: u64,
    },
    /// Server → client: an out-of-band entity delta.
    ServerUpdate {
        /// The delta.
        update: ServerUpdate,
    },
    /// Server → client: an out-of-band conflict notice.
    Conflict {
        /// The conflict.
        conflict: ConflictRecord,
    },
    /// Either direction: a protocol-level error.
    Error {
        /// Machine-readable code (`auth_failed`, `bad_request`, ...).
        code: String,
        /// Human-readable detail.
        message: String,
    },
    /// Server → client: positive acknowledgment of a frame that has
    /// no dedicated response type (currently `auth`).
    Ack {
        /// What is being acknowledged.
        request_id: String,
    },
    /// Server → client: the server's view of this client changed.
    StatusChange {
        /// New status label.
        status: String,
    },
}

impl ChannelMessage {
    /// The wire tag of this frame.
    pub fn tag(&self) -> &'static str {
        match self {
            ChannelMessage::Auth { .. } => "auth",
            ChannelMessage::Sync { .. } => "sync",
            ChannelMessage::SyncResponse { .. } => "sync_response",
            ChannelMessage::Ping { .. } => "ping",
            ChannelMessage::Pong { .. } => "pong",
            ChannelMessage::ServerUpdate { .. } => "server_update",
            ChannelMessage::Conflict { .. } => "conflict",
            ChannelMessage::Error { .. } => "error",
            ChannelMessage::Ack { .. } => "ack",
            ChannelMessage::StatusChange { .. } => "status_change",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::ClientState;
    use serde_json::json;

    #[test]
    fn tags_match_wire_encoding() {
        let msg = ChannelMessage::Ping { seq: 7 };
        let raw = serde_json::to_value(&msg).unwrap();
        assert_eq!(raw["type"], json!("ping"));
        assert_eq!(msg.tag(), "ping");

        let msg = ChannelMessage::StatusChange {
            status: "degraded".into(),
        };
        let raw = serde_json::to_value(&msg).unwrap();
        assert_eq!(raw["type"], json!("status_change"));
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let raw = json!({"type": "telemetry", "data": {}});
        let result: Result<ChannelMessage, _> = serde_json::from_value(raw);
        assert!(result.is_err());
    }

    #[test]
    fn missing_tag_is_rejected() {
        let raw = json!({"seq": 1});
        let result: Result<ChannelMessage, _> = serde_json::from_value(raw);
        assert!(result.is_err());
    }

    #[test]
    fn sync_frame_roundtrip() {
        let request = SyncRequest::new(
            "client-1",
            ClientState {
                last_sync_time: 500,
                pending_operations: 2,
            },
            vec![],
        );
        let request_id = request.request_id.clone();
        let msg = ChannelMessage::Sync { request };

        let raw = serde_json::to_string(&msg).unwrap();
        let back: ChannelMessage = serde_json::from_str(&raw).unwrap();
        match back {
            ChannelMessage::Sync { request } => assert_eq!(request.request_id, request_id),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn ping_pong_roundtrip() {
        let raw = serde_json::to_string(&ChannelMessage::Pong { seq: 42 }).unwrap();
        let back: ChannelMessage = serde_json::from_str(&raw).unwrap();
        assert_eq!(back, ChannelMessage::Pong { seq: 42 });
    }
}
