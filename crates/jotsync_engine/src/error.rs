//! Error types for the sync engine.

use jotsync_store::StoreError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
///
/// Conflicts are deliberately absent: a detected divergence is a
/// first-class outcome surfaced through the conflict state, not an
/// error.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Failed to establish or authenticate a connection. Fatal per
    /// attempt; retried only via backoff or the fallback transport.
    #[error("connection failed: {0}")]
    Connection(String),

    /// A request or heartbeat deadline passed unanswered.
    #[error("timed out waiting for {0}")]
    Timeout(String),

    /// The server rejected our credentials. Fatal; surfaced to the
    /// application, never retried automatically.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The server asked us to slow down.
    #[error("rate limited")]
    RateLimited {
        /// Server-specified delay before the next attempt, in
        /// milliseconds.
        retry_after_ms: Option<u64>,
    },

    /// A transient network failure.
    #[error("network error: {0}")]
    Network(String),

    /// The connection dropped while a request was in flight.
    #[error("connection closed")]
    ConnectionClosed,

    /// Not connected to any transport.
    #[error("not connected")]
    NotConnected,

    /// A local queue programming or data error (operation not found,
    /// illegal status transition). Surfaced immediately.
    #[error("queue error: {0}")]
    Queue(String),

    /// The durable store failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// A malformed or unexpected wire message.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// An illegal sync state machine transition was attempted.
    #[error("invalid state transition from {from} to {to}")]
    InvalidTransition {
        /// Current state.
        from: String,
        /// Attempted target state.
        to: String,
    },

    /// A recovery sync was requested while one is already running.
    #[error("a recovery sync is already in progress")]
    SyncInProgress,

    /// No unresolved conflict matches the given entity.
    #[error("no unresolved conflict for entity {entity_id}")]
    ConflictNotFound {
        /// The entity that was looked up.
        entity_id: i64,
    },
}

impl SyncError {
    /// Returns true if a retry (with backoff) may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Timeout(_)
                | SyncError::RateLimited { .. }
                | SyncError::Network(_)
                | SyncError::ConnectionClosed
        )
    }

    /// Returns true if this error means connectivity is gone and the
    /// engine should go offline rather than error out.
    pub fn is_connectivity_loss(&self) -> bool {
        matches!(
            self,
            SyncError::Network(_)
                | SyncError::ConnectionClosed
                | SyncError::NotConnected
                | SyncError::Connection(_)
        )
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Protocol(err.to_string())
    }
}
