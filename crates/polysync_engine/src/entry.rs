//! Mapping entry engine: one member's side of one mapping.

use polysync_types::{Change, ChangeType, MappingEntry, MemberId};

/// Holds the latest change seen from one member for one mapping.
#[derive(Debug, Clone)]
pub struct MappingEntryEngine {
    sink: usize,
    entry: MappingEntry,
    change: Option<Change>,
    dirty: bool,
}

impl MappingEntryEngine {
    /// Creates the entry for the sink at position `sink`.
    pub fn new(sink: usize, entry: MappingEntry) -> Self {
        Self {
            sink,
            entry,
            change: None,
            dirty: false,
        }
    }

    /// Position of the owning sink within its object type.
    pub fn sink(&self) -> usize {
        self.sink
    }

    /// Member owning this entry.
    pub fn member_id(&self) -> MemberId {
        self.entry.member_id
    }

    /// Archived identity of the entry.
    pub fn entry(&self) -> &MappingEntry {
        &self.entry
    }

    pub(crate) fn entry_mut(&mut self) -> &mut MappingEntry {
        &mut self.entry
    }

    /// Current change, if any.
    pub fn change(&self) -> Option<&Change> {
        self.change.as_ref()
    }

    /// Changetype of the current change, `Unknown` without one.
    pub fn changetype(&self) -> ChangeType {
        self.change
            .as_ref()
            .map_or(ChangeType::Unknown, |c| c.changetype)
    }

    /// True iff the archived uid for this member equals `change.uid`.
    pub fn matches(&self, change: &Change) -> bool {
        self.entry.uid.is_some() && self.entry.uid == change.uid
    }

    /// True if the member must be (re)written.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Sets the write-pending flag.
    pub fn set_dirty(&mut self, dirty: bool) {
        self.dirty = dirty;
    }

    /// Replaces the change. Callers go through `MappingEngine::update_entry`
    /// so the mapping's synced flag follows.
    pub(crate) fn replace_change(&mut self, change: Option<Change>) -> Option<Change> {
        std::mem::replace(&mut self.change, change)
    }

    pub(crate) fn change_mut(&mut self) -> Option<&mut Change> {
        self.change.as_mut()
    }
}
