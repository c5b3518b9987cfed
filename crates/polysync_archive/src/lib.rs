//! # PolySync Archive
//!
//! Durable store of mapping identity across sync sessions.
//!
//! This crate provides:
//! - Per-object-type change rows `(id, uid, mappingid, memberid)`
//! - The ignored-conflicts ledger
//! - Opaque per-item data blobs for format mergers
//!
//! ## Key Invariants
//!
//! - Rows of one mapping are returned contiguously by [`Archive::load_changes`]
//! - Inserting a row for an unpersisted mapping stamps the mapping id in the
//!   same transaction, so no row is ever left with mapping id `0`
//! - The archive is used from a single thread and has no internal locking

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod archive;
mod error;

pub use archive::{Archive, ArchivedChange, IgnoredConflict};
pub use error::{ArchiveError, ArchiveResult};
