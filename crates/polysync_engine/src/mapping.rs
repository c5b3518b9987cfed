//! Mapping engine: conflict detection, resolution and propagation for one
//! logical item.
//!
//! Per sync cycle a mapping moves from clean (`synced`) through a conflict
//! check to either resolved (master set) or conflicted (queued for a
//! decision), and finally to propagated once `multiply` copied the master
//! to every other entry.

use crate::entry::MappingEntryEngine;
use crate::error::{EngineError, EngineResult};
use polysync_types::{
    Change, ChangeType, CompareResult, FormatEnv, Mapping, MappingEntry, MappingId, MemberId,
};
use tracing::{debug, trace};

/// Outcome of [`MappingEngine::check_conflict`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictCheck {
    /// A master was already set; nothing was evaluated.
    Mastered,
    /// No entry holds a change.
    Empty,
    /// The entries disagree.
    Conflict,
    /// The entries agree. `synced` means every member reported the same
    /// content and nothing has to be written.
    Solved {
        /// Whether the mapping is fully in sync.
        synced: bool,
    },
}

/// Where one entry lands when a conflicted mapping is split.
#[derive(Debug, Clone)]
pub(crate) struct Placement {
    pub(crate) pos: usize,
    /// `0` is the original mapping, `n` the n-th new one.
    pub(crate) slot: usize,
    pub(crate) change: Change,
    pub(crate) dirty: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct DuplicatePlan {
    pub(crate) placements: Vec<Placement>,
    pub(crate) new_mappings: usize,
    pub(crate) dropped: Vec<usize>,
}

/// One logical item: one entry per member of the object type.
#[derive(Debug, Clone)]
pub struct MappingEngine {
    id: MappingId,
    objtype: String,
    entries: Vec<MappingEntryEngine>,
    master: Option<usize>,
    conflict: bool,
    synced: bool,
}

impl MappingEngine {
    /// Creates a mapping from its entries, one per sink in sink order.
    pub fn new(id: MappingId, objtype: impl Into<String>, entries: Vec<MappingEntryEngine>) -> Self {
        Self {
            id,
            objtype: objtype.into(),
            entries,
            master: None,
            conflict: false,
            synced: true,
        }
    }

    /// Creates an empty mapping for the given members.
    pub fn empty(objtype: impl Into<String>, members: &[MemberId]) -> Self {
        let entries = members
            .iter()
            .enumerate()
            .map(|(pos, member)| MappingEntryEngine::new(pos, MappingEntry::new(*member)))
            .collect();
        Self::new(0, objtype, entries)
    }

    /// Archive id, `0` until first saved.
    pub fn id(&self) -> MappingId {
        self.id
    }

    pub(crate) fn set_id(&mut self, id: MappingId) {
        self.id = id;
    }

    /// Object type.
    pub fn objtype(&self) -> &str {
        &self.objtype
    }

    /// Entries in sink order.
    pub fn entries(&self) -> &[MappingEntryEngine] {
        &self.entries
    }

    /// Entry of the sink at `pos`.
    pub fn entry(&self, pos: usize) -> Option<&MappingEntryEngine> {
        self.entries.get(pos)
    }

    pub(crate) fn entry_mut(&mut self, pos: usize) -> Option<&mut MappingEntryEngine> {
        self.entries.get_mut(pos)
    }

    /// Position of the member's entry.
    pub fn position_of(&self, member_id: MemberId) -> Option<usize> {
        self.entries.iter().position(|e| e.member_id() == member_id)
    }

    /// Position of the master entry.
    pub fn master(&self) -> Option<usize> {
        self.master
    }

    /// The master entry.
    pub fn master_entry(&self) -> Option<&MappingEntryEngine> {
        self.master.and_then(|pos| self.entries.get(pos))
    }

    pub(crate) fn set_master(&mut self, pos: usize) {
        self.master = Some(pos);
    }

    /// True while the entries disagree without a decision.
    pub fn is_conflict(&self) -> bool {
        self.conflict
    }

    pub(crate) fn set_conflict(&mut self, conflict: bool) {
        self.conflict = conflict;
        if conflict {
            self.master = None;
        }
    }

    /// True if no write is required.
    pub fn is_synced(&self) -> bool {
        self.synced
    }

    /// Snapshot of the mapping's identity.
    pub fn mapping(&self) -> Mapping {
        Mapping {
            id: self.id,
            entries: self.entries.iter().map(|e| e.entry().clone()).collect(),
        }
    }

    /// First entry holding a change.
    pub fn representative(&self) -> Option<&Change> {
        self.entries.iter().find_map(|e| e.change())
    }

    /// Replaces the change of the entry at `pos`; the mapping is no longer
    /// considered synced.
    pub fn update_entry(&mut self, pos: usize, change: Option<Change>) {
        if let Some(entry) = self.entries.get_mut(pos) {
            entry.replace_change(change);
            self.synced = false;
        }
    }

    /// Detects conflicts among the reported changes.
    ///
    /// The first entry with a known changetype is the candidate master. The
    /// first pair of known entries that is not content-equal marks the
    /// mapping as conflicted. When literally every pair of entries compared
    /// equal the mapping is synced and its dirty flags are cleared.
    pub fn check_conflict(&mut self, formats: &dyn FormatEnv) -> ConflictCheck {
        if self.master.is_some() {
            return ConflictCheck::Mastered;
        }
        if self.conflict {
            return ConflictCheck::Conflict;
        }

        let known: Vec<(usize, &Change)> = self
            .entries
            .iter()
            .enumerate()
            .filter_map(|(pos, e)| e.change().map(|c| (pos, c)))
            .filter(|(_, c)| c.changetype.is_known())
            .collect();
        let Some(&(first, _)) = known.first() else {
            return ConflictCheck::Empty;
        };

        let mut is_same = 0;
        for (i, (_, left)) in known.iter().enumerate() {
            for (_, right) in &known[i + 1..] {
                if formats.compare(left, right) != CompareResult::Same {
                    debug!(mapping_id = self.id, objtype = %self.objtype, "conflict detected");
                    self.set_conflict(true);
                    return ConflictCheck::Conflict;
                }
                is_same += 1;
            }
        }

        self.master = Some(first);
        let synced = is_same == pair_count(self.entries.len());
        if synced {
            self.synced = true;
            for entry in &mut self.entries {
                entry.set_dirty(false);
            }
        }
        trace!(mapping_id = self.id, master = first, synced, "conflict check passed");
        ConflictCheck::Solved { synced }
    }

    /// Copies the master's change to every other entry and marks them dirty.
    ///
    /// The propagated changetype depends on what the entry held before;
    /// the uid is the archived uid of that member, or the master's uid when
    /// the member never had one.
    pub fn multiply(&mut self) -> EngineResult<()> {
        if self.synced {
            return Ok(());
        }
        let master = self.master.ok_or(EngineError::NoMaster)?;
        let master_change = self
            .entries
            .get(master)
            .and_then(|e| e.change())
            .cloned()
            .ok_or(EngineError::NoMaster)?;

        for (pos, entry) in self.entries.iter_mut().enumerate() {
            if pos == master {
                continue;
            }
            let existing = entry.replace_change(None);
            let existing_type = existing
                .as_ref()
                .map_or(ChangeType::Unknown, |c| c.changetype);
            let existing_uid = existing.and_then(|c| c.uid);

            let mut change = master_change.clone();
            change.uid = match (&entry.entry().uid, existing_uid) {
                (Some(uid), _) => Some(uid.clone()),
                (None, None) => master_change.uid.clone(),
                (None, Some(uid)) => Some(uid),
            };
            change.changetype = propagated_type(master_change.changetype, existing_type);

            trace!(
                mapping_id = self.id,
                member_id = entry.member_id(),
                changetype = ?change.changetype,
                "propagating master"
            );
            entry.replace_change(Some(change));
            entry.set_dirty(true);
        }
        Ok(())
    }

    /// Makes the entry at `pos` the master and clears the conflict.
    pub fn solve(&mut self, pos: usize) -> EngineResult<()> {
        let has_change = self
            .entries
            .get(pos)
            .is_some_and(|e| e.changetype().is_known());
        if !has_change {
            return Err(EngineError::NoMaster);
        }
        self.master = Some(pos);
        self.conflict = false;
        Ok(())
    }

    /// Finds the entry with the strictly greatest revision.
    pub fn latest_entry(&self, formats: &dyn FormatEnv) -> EngineResult<usize> {
        let mut latest: Option<(i64, usize)> = None;
        let mut tied = false;

        for (pos, entry) in self.entries.iter().enumerate() {
            let Some(change) = entry.change() else {
                continue;
            };
            if !change.changetype.is_known() || !change.has_data() {
                continue;
            }
            let revision = formats.revision(change)?.ok_or_else(|| {
                EngineError::generic(format!(
                    "change of member {} carries no revision",
                    entry.member_id()
                ))
            })?;
            if revision < 0 {
                return Err(EngineError::generic(format!(
                    "invalid revision {revision} from member {}",
                    entry.member_id()
                )));
            }

            match latest {
                Some((best, _)) if revision == best => tied = true,
                Some((best, _)) if revision < best => {}
                _ => {
                    latest = Some((revision, pos));
                    tied = false;
                }
            }
        }

        if tied {
            return Err(EngineError::RevisionTie);
        }
        latest
            .map(|(_, pos)| pos)
            .ok_or_else(|| EngineError::generic("can't find the latest change"))
    }

    /// Makes the most recently changed entry the master.
    pub fn use_latest(&mut self, formats: &dyn FormatEnv) -> EngineResult<usize> {
        let pos = self.latest_entry(formats)?;
        self.solve(pos)?;
        Ok(pos)
    }

    /// True if latest-wins resolution can decide this mapping.
    pub fn supports_use_latest(&self, formats: &dyn FormatEnv) -> bool {
        self.latest_entry(formats).is_ok()
    }

    /// Clears the conflict without choosing a master; nothing is written
    /// for this mapping in the current session.
    pub(crate) fn mark_ignored(&mut self) {
        self.conflict = false;
        self.master = None;
        self.synced = true;
    }

    /// Computes how a conflicted mapping splits into conflict-free ones.
    ///
    /// Entries that are neither Added nor Modified are dropped. Every other
    /// entry joins the first mapping (the original first) whose
    /// representative compares Same, or a new mapping. Its change is
    /// elevated once per mapping it was compared against and rejected by.
    pub(crate) fn plan_duplicate(&self, formats: &dyn FormatEnv) -> EngineResult<DuplicatePlan> {
        let mut candidates = Vec::new();
        let mut dropped = Vec::new();
        for (pos, entry) in self.entries.iter().enumerate() {
            match entry.changetype() {
                ChangeType::Added | ChangeType::Modified => candidates.push(pos),
                _ if entry.change().is_some() => dropped.push(pos),
                _ => {}
            }
        }

        let mut representatives: Vec<Change> = Vec::new();
        if let Some(first) = candidates.first().and_then(|pos| self.entries[*pos].change()) {
            representatives.push(first.clone());
        } else {
            return Err(EngineError::NoMaster);
        }

        let mut placements = Vec::with_capacity(candidates.len());
        for pos in candidates {
            let Some(change) = self.entries[pos].change() else {
                continue;
            };

            let slot = representatives
                .iter()
                .position(|rep| formats.compare(change, rep) == CompareResult::Same);
            let elevation = slot.unwrap_or(representatives.len());

            let mut elevated = change.clone();
            let mut dirty = false;
            for _ in 0..elevation {
                let step = formats.elevate(&elevated)?;
                dirty |= step.dirty;
                elevated = step.change;
            }

            let slot = match slot {
                Some(slot) => slot,
                None => {
                    representatives.push(elevated.clone());
                    representatives.len() - 1
                }
            };
            placements.push(Placement {
                pos,
                slot,
                change: elevated,
                dirty,
            });
        }

        Ok(DuplicatePlan {
            placements,
            new_mappings: representatives.len() - 1,
            dropped,
        })
    }
}

fn pair_count(n: usize) -> usize {
    n * n.saturating_sub(1) / 2
}

fn propagated_type(master: ChangeType, existing: ChangeType) -> ChangeType {
    match (master, existing) {
        (ChangeType::Added, ChangeType::Added | ChangeType::Modified) => ChangeType::Modified,
        (ChangeType::Modified, ChangeType::Deleted) => ChangeType::Added,
        (master, _) => master,
    }
}
