//! # jotsync Store
//!
//! Durable local store contract for the jotsync engine.
//!
//! The sync engine treats on-device persistence as an external
//! collaborator: a generic document store exposing get/put/delete and
//! index scans per collection, plus a small metadata key/value surface
//! for the sync watermark and device identifiers.
//!
//! This crate provides:
//! - [`LocalStore`], the contract every backend must satisfy
//! - [`MemoryStore`], a thread-safe in-memory backend for tests and
//!   ephemeral use
//!
//! ## Atomicity
//!
//! The contract guarantees per-item atomicity only. There is no
//! multi-put transaction; callers that write several items in a pass
//! must tolerate partial application if interrupted.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod memory;

pub use backend::LocalStore;
pub use error::{StoreError, StoreResult};
pub use memory::MemoryStore;
