//! Status and conflict callbacks.
//!
//! Callbacks run on the engine thread, outside the registry lock, so a
//! callback may replace any callback including itself. Resolution
//! decisions go through the [`Resolver`].

use crate::command::{MappingRef, Resolver};
use crate::phase::Phase;
use parking_lot::Mutex;
use polysync_types::{Change, MappingId, MemberId};
use std::sync::Arc;
use tracing::{debug, warn};

/// Group-level events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineEvent {
    /// All members and object types connected.
    Connected,
    /// The session failed.
    Error,
    /// All changes were read.
    Read,
    /// All changes were written.
    Written,
    /// All members acknowledged the end of the sync.
    SyncDone,
    /// All members disconnected.
    Disconnected,
    /// The session finished without error.
    Successful,
    /// Every conflict of the session has been reported.
    EndConflicts,
    /// The previous session did not shut down cleanly.
    PrevUnclean,
}

/// Per-member events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberEvent {
    /// Connected.
    Connected,
    /// A request failed.
    Error,
    /// Finished reporting changes.
    Read,
    /// Finished committing changes.
    Written,
    /// Acknowledged the end of the sync.
    SyncDone,
    /// Disconnected.
    Disconnected,
    /// Finished discovery.
    Discovered,
}

impl MemberEvent {
    pub(crate) fn for_phase(phase: Phase) -> Self {
        match phase {
            Phase::Connect => MemberEvent::Connected,
            Phase::Read => MemberEvent::Read,
            Phase::Write => MemberEvent::Written,
            Phase::SyncDone => MemberEvent::SyncDone,
            Phase::Disconnect => MemberEvent::Disconnected,
        }
    }
}

/// Per-change events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeEvent {
    /// Received from a member.
    Read,
    /// Committed to a member.
    Written,
    /// Could not be processed.
    Error,
}

/// Per-mapping events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingEvent {
    /// The mapping has a master or was ignored.
    Solved,
    /// A resolution attempt failed.
    Error,
}

/// Member status update.
#[derive(Debug, Clone)]
pub struct MemberUpdate {
    /// What happened.
    pub event: MemberEvent,
    /// Member.
    pub member_id: MemberId,
    /// Object type, `None` for the member as a whole.
    pub objtype: Option<String>,
    /// Error message for `MemberEvent::Error`.
    pub error: Option<String>,
}

/// Change status update.
#[derive(Debug, Clone)]
pub struct ChangeUpdate {
    /// What happened.
    pub event: ChangeEvent,
    /// The change.
    pub change: Change,
    /// Member the change belongs to.
    pub member_id: MemberId,
    /// Mapping holding the change, once known.
    pub mapping_id: Option<MappingId>,
    /// Error message for `ChangeEvent::Error`.
    pub error: Option<String>,
}

/// Mapping status update.
#[derive(Debug, Clone)]
pub struct MappingUpdate {
    /// What happened.
    pub event: MappingEvent,
    /// Member whose entry became the master.
    pub winner: Option<MemberId>,
    /// Mapping id, `0` if not persisted yet.
    pub mapping_id: MappingId,
    /// Error message for `MappingEvent::Error`.
    pub error: Option<String>,
}

/// Engine status update.
#[derive(Debug, Clone)]
pub struct EngineUpdate {
    /// What happened.
    pub event: EngineEvent,
    /// Error message for `EngineEvent::Error`.
    pub error: Option<String>,
}

/// One member's side of a conflict.
#[derive(Debug, Clone)]
pub struct ConflictEntry {
    /// Member.
    pub member_id: MemberId,
    /// The member's current change, if it reported one.
    pub change: Option<Change>,
}

/// A mapping whose entries disagree.
#[derive(Debug, Clone)]
pub struct MappingConflict {
    /// Object type.
    pub objtype: String,
    /// Mapping id, `0` if not persisted yet.
    pub mapping_id: MappingId,
    /// Entries in member order.
    pub entries: Vec<ConflictEntry>,
    /// Every member can re-read single items.
    pub supports_ignore: bool,
    /// Every entry carries a usable revision.
    pub supports_use_latest: bool,
    resolver: Resolver,
}

impl MappingConflict {
    pub(crate) fn new(
        objtype: String,
        mapping_id: MappingId,
        entries: Vec<ConflictEntry>,
        supports_ignore: bool,
        supports_use_latest: bool,
        resolver: Resolver,
    ) -> Self {
        Self {
            objtype,
            mapping_id,
            entries,
            supports_ignore,
            supports_use_latest,
            resolver,
        }
    }

    /// Handle for resolving this conflict.
    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    /// The conflicted mapping.
    pub fn mapping(&self) -> MappingRef {
        self.resolver.mapping()
    }
}

pub(crate) type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    conflict: Option<Callback<MappingConflict>>,
    member: Option<Callback<MemberUpdate>>,
    change: Option<Callback<ChangeUpdate>>,
    mapping: Option<Callback<MappingUpdate>>,
    engine: Option<Callback<EngineUpdate>>,
}

/// Callback registry shared between the `Engine` handle and its thread.
#[derive(Clone, Default)]
pub(crate) struct StatusHub {
    inner: Arc<Mutex<Callbacks>>,
}

impl StatusHub {
    pub(crate) fn set_conflict(&self, callback: Callback<MappingConflict>) {
        self.inner.lock().conflict = Some(callback);
    }

    pub(crate) fn set_member(&self, callback: Callback<MemberUpdate>) {
        self.inner.lock().member = Some(callback);
    }

    pub(crate) fn set_change(&self, callback: Callback<ChangeUpdate>) {
        self.inner.lock().change = Some(callback);
    }

    pub(crate) fn set_mapping(&self, callback: Callback<MappingUpdate>) {
        self.inner.lock().mapping = Some(callback);
    }

    pub(crate) fn set_engine(&self, callback: Callback<EngineUpdate>) {
        self.inner.lock().engine = Some(callback);
    }

    pub(crate) fn conflict(&self, conflict: MappingConflict) {
        let callback = self.inner.lock().conflict.clone();
        match callback {
            Some(callback) => callback(&conflict),
            None => warn!(
                objtype = %conflict.objtype,
                mapping_id = conflict.mapping_id,
                "conflict reported without a conflict callback"
            ),
        }
    }

    pub(crate) fn member(&self, update: MemberUpdate) {
        debug!(member_id = update.member_id, objtype = ?update.objtype, event = ?update.event, "member status");
        let callback = self.inner.lock().member.clone();
        if let Some(callback) = callback {
            callback(&update);
        }
    }

    pub(crate) fn change(&self, update: ChangeUpdate) {
        let callback = self.inner.lock().change.clone();
        if let Some(callback) = callback {
            callback(&update);
        }
    }

    pub(crate) fn mapping(&self, update: MappingUpdate) {
        debug!(mapping_id = update.mapping_id, event = ?update.event, "mapping status");
        let callback = self.inner.lock().mapping.clone();
        if let Some(callback) = callback {
            callback(&update);
        }
    }

    pub(crate) fn engine(&self, update: EngineUpdate) {
        debug!(event = ?update.event, error = ?update.error, "engine status");
        let callback = self.inner.lock().engine.clone();
        if let Some(callback) = callback {
            callback(&update);
        }
    }
}
