//! # jotsync Protocol
//!
//! Sync protocol types for jotsync.
//!
//! This crate provides:
//! - [`SyncableEntity`] and the entity-type vocabulary
//! - [`QueuedOperation`] for the offline operation queue
//! - [`ConflictRecord`] for detected divergence
//! - Wire messages: [`SyncRequest`]/[`SyncResponse`], the duplex
//!   [`ChannelMessage`] union, and the polling endpoint payloads
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod channel;
mod conflict;
mod entity;
mod messages;
mod operation;
mod polling;

pub use channel::ChannelMessage;
pub use conflict::{ConflictPolicy, ConflictRecord, ResolutionStrategy};
pub use entity::{EntityType, SyncableEntity};
pub use messages::{
    ClientState, OperationResult, ServerUpdate, SyncRequest, SyncResponse, SyncStatus,
};
pub use operation::{OperationStatus, OperationType, QueuedOperation};
pub use polling::{PollRequest, PollResponse};
