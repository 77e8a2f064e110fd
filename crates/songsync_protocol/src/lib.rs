//! # songsync protocol
//!
//! Wire types and codecs for songsync replication.
//!
//! This crate provides:
//! - `Document`, `DocumentId` and `PatchId`
//! - `PatchVersion`, the comma-joined version chain entry
//! - `Patch` / `FieldPatchSet`, the CBOR patch payload
//! - the character-level field patch codec (`textpatch`)
//! - control messages (health, reject, sequence request, files, position)
//! - the namespace-scoped topic layout
//! - `Conflict` records
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cbor;
mod conflict;
mod document;
mod error;
mod messages;
mod patch;
pub mod textpatch;
mod topic;
mod version;

pub use cbor::{from_cbor, to_cbor};
pub use conflict::Conflict;
pub use document::{fields, Document, DocumentId, PatchId};
pub use error::{ProtocolError, ProtocolResult};
pub use messages::{ChangeReject, FileRequest, FileSetResponse, Health, PatchRequest, Position};
pub use patch::{AppliedDocument, FieldPatchSet, Patch};
pub use textpatch::{apply_patch_text, make_patch_text, PatchOutcome, TextPatch};
pub use topic::{QoS, TopicFilter, TopicSpec, Topics};
pub use version::{now_millis, PatchVersion};
