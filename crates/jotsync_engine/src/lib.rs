//! # jotsync Engine
//!
//! Offline-first synchronization engine for jotsync.
//!
//! The engine keeps a local entity cache in sync with a server across
//! unreliable connectivity:
//!
//! - [`ConnectivityMonitor`] tracks reachability via an active probe
//! - [`OfflineQueue`] records local mutations durably while offline
//! - [`MergeEngine`] detects conflicts and merges field-by-field
//! - [`ChannelTransport`] / [`PollingTransport`] carry the protocol
//! - [`RecoveryOrchestrator`] replays the queue and reconciles deltas
//! - [`SyncService`] composes the above behind the [`SyncState`]
//!   machine
//!
//! The engine is synchronous and cooperative: timer-driven behavior
//! advances on [`SyncService::tick`], and all time flows through an
//! injected [`Clock`], so tests run under virtual time.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod clock;
mod config;
mod connectivity;
mod error;
mod merge;
mod queue;
mod recovery;
mod state;
mod transport;

pub use clock::{Clock, SystemClock, Timer, VirtualClock};
pub use config::{HeartbeatConfig, PollConfig, RetryConfig, SyncConfig};
pub use connectivity::{ConnectivityMonitor, Probe, SubscriptionId};
pub use error::{SyncError, SyncResult};
pub use merge::{merge_field_value, MergeEngine, MergeOutcome, VersionComparison};
pub use queue::OfflineQueue;
pub use recovery::{RecoveryOrchestrator, RecoveryPhase, RecoveryReport};
pub use state::{SyncService, SyncState, SyncStats, SyncStatusSnapshot};
pub use transport::{
    ChannelState, ChannelTransport, Credentials, DuplexSocket, MockTransport, PollClient,
    PollError, PollStatus, PollingTransport, SocketConnector, Transport, TransportEvent,
    TransportKind,
};
