//! # songsync engine
//!
//! Replication engine for songsync document collections.
//!
//! This crate provides:
//! - Sync state machine (resetting → loading → catching up → synced)
//! - Ordered patch application with buffering of early arrivals
//! - Offline edit collection, flush and conflict detection
//! - Bounded gap retry with exponential backoff
//! - Pub/sub transport abstraction with an in-memory broker
//! - Typed properties bound to topics
//! - Persistence of the synced snapshot
//!
//! ## Architecture
//!
//! Clients never write the shared collection directly. A client diffs its
//! working copy against the last synced snapshot, publishes the result as
//! a patch, and proposes the next sequence number for it. The database
//! service accepts exactly one proposal per sequence; every client,
//! including the author, applies a patch only once its version has been
//! announced.
//!
//! ## Key Invariants
//!
//! - Versions are applied in strict sequence order, without gaps
//! - The current sequence never decreases except through a reset
//! - Offline edits are published at most once
//! - Remote changes win; superseded offline edits become `Conflict`s

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod arbiter;
mod channels;
mod config;
mod error;
mod files;
mod persistence;
mod property;
mod state;
mod store;
mod transport;

pub use arbiter::ChainArbiter;
pub use channels::{RoomChannels, SyncChannels};
pub use config::{PublishMode, RetryConfig, SyncConfig};
pub use error::{SyncError, SyncResult};
pub use files::{FileExchange, FileTransfer};
pub use persistence::{StoredSnapshot, SyncState, SyncStorage, DOCUMENTS_FILE, STATE_FILE};
pub use property::{codecs, Listener, ListenerId, PropertyBuilder, PropertyCodec, SyncedProperty};
pub use state::{ResetReason, SyncEngine, SyncEvent, SyncPhase, SyncStats, VersionSource};
pub use store::{DocumentStore, WorkingCopy, WorkingCopyChange, WorkingCopyListener};
pub use transport::{
    ConnectionLostHandler, MemoryBroker, MemoryTransport, MessageHandler, PubSubTransport,
    Publisher, QueuedMessage, SubscriptionId,
};
