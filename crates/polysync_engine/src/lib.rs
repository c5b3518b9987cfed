//! # PolySync Engine
//!
//! Multi-member synchronization and conflict resolution.
//!
//! This crate provides:
//! - The engine handle and its single-threaded engine loop
//! - Per-object-type phase drivers joining asynchronous member answers
//! - Mapping engines: conflict detection, solve, duplicate, ignore,
//!   latest-wins, and propagation of the master
//! - The member proxy interface with reply handles
//! - Status and conflict callbacks
//! - Group locking and engine configuration
//!
//! ## Session
//!
//! A session runs Connect, Read, Write, SyncDone and Disconnect. Each phase
//! is fanned out to every member of every object type; an object type
//! completes a phase once all its sinks finished or errored, and the group
//! completes it once every object type and every member did.
//!
//! ## Key Invariants
//!
//! - Engine state is owned by the engine thread; other threads only post
//!   messages to its queue
//! - A mapping has a master iff it is not in conflict
//! - Within an object type, phases never overlap
//! - The archive is updated before the in-memory mapping

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod command;
mod config;
mod driver;
mod engine;
mod entry;
mod error;
mod lock;
mod mapping;
mod obj_engine;
mod phase;
mod proxy;
mod sink;
mod status;

pub use command::{MappingRef, Resolver};
pub use config::EngineConfig;
pub use engine::{Engine, EngineState};
pub use entry::MappingEntryEngine;
pub use error::{EngineError, EngineResult};
pub use lock::{GroupLock, LockState};
pub use mapping::{ConflictCheck, MappingEngine};
pub use phase::{CompletionSet, Phase, PhaseTracker};
pub use proxy::{ChangesReply, CommitReply, DiscoverReply, FinalizeReply, MemberProxy, PhaseReply};
pub use sink::SinkEngine;
pub use status::{
    ChangeEvent, ChangeUpdate, ConflictEntry, EngineEvent, EngineUpdate, MappingConflict,
    MappingEvent, MappingUpdate, MemberEvent, MemberUpdate,
};
