//! Mapping identity: which uid at which member is the same item.

use serde::{Deserialize, Serialize};

/// Stable member identifier within a group.
pub type MemberId = i64;

/// Archive-assigned mapping identifier. `0` means not persisted yet.
pub type MappingId = i64;

/// One member's side of a mapping.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MappingEntry {
    /// Archive row id, `0` until first saved.
    pub id: i64,
    /// Member owning this entry.
    pub member_id: MemberId,
    /// Uid of the item at that member, once known.
    pub uid: Option<String>,
}

impl MappingEntry {
    /// Creates an entry that has never been persisted.
    pub fn new(member_id: MemberId) -> Self {
        Self {
            id: 0,
            member_id,
            uid: None,
        }
    }

    /// Creates an entry loaded from the archive.
    pub fn stored(id: i64, member_id: MemberId, uid: impl Into<String>) -> Self {
        Self {
            id,
            member_id,
            uid: Some(uid.into()),
        }
    }
}

/// A set of per-member entries believed to be the same logical item.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Mapping {
    /// Mapping id.
    pub id: MappingId,
    /// Entries, at most one per member.
    pub entries: Vec<MappingEntry>,
}

impl Mapping {
    /// Creates an empty mapping.
    pub fn new(id: MappingId) -> Self {
        Self {
            id,
            entries: Vec::new(),
        }
    }

    /// Returns true once the archive has assigned an id.
    pub fn is_persisted(&self) -> bool {
        self.id != 0
    }

    /// Returns the entry for `member_id`.
    pub fn entry_for(&self, member_id: MemberId) -> Option<&MappingEntry> {
        self.entries.iter().find(|e| e.member_id == member_id)
    }

    /// Adds or replaces the entry of its member.
    pub fn set_entry(&mut self, entry: MappingEntry) {
        match self
            .entries
            .iter_mut()
            .find(|e| e.member_id == entry.member_id)
        {
            Some(slot) => *slot = entry,
            None => self.entries.push(entry),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_entry_replaces_per_member() {
        let mut mapping = Mapping::new(0);
        assert!(!mapping.is_persisted());

        mapping.set_entry(MappingEntry::stored(1, 10, "a"));
        mapping.set_entry(MappingEntry::stored(2, 20, "b"));
        mapping.set_entry(MappingEntry::stored(3, 10, "a2"));

        assert_eq!(mapping.entries.len(), 2);
        assert_eq!(mapping.entry_for(10).and_then(|e| e.uid.as_deref()), Some("a2"));
        assert!(mapping.entry_for(30).is_none());
    }
}
