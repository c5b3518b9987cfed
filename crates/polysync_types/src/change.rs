//! Changes reported by members.

use serde::{Deserialize, Serialize};

/// How an item changed at a member since the previous sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeType {
    /// Nothing known about the item (placeholder slots, unchanged items).
    Unknown,
    /// The item is new at the member.
    Added,
    /// The item was changed at the member.
    Modified,
    /// The item was removed at the member.
    Deleted,
}

impl ChangeType {
    /// Returns the integer code stored in the archive.
    pub fn to_code(self) -> i64 {
        match self {
            ChangeType::Unknown => 0,
            ChangeType::Added => 1,
            ChangeType::Deleted => 2,
            ChangeType::Modified => 3,
        }
    }

    /// Parses an archive code.
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(ChangeType::Unknown),
            1 => Some(ChangeType::Added),
            2 => Some(ChangeType::Deleted),
            3 => Some(ChangeType::Modified),
            _ => None,
        }
    }

    /// Returns true for everything except `Unknown`.
    pub fn is_known(self) -> bool {
        self != ChangeType::Unknown
    }
}

/// One member's report about one item.
///
/// Changes are replaced wholesale when a newer report arrives; the engine
/// never edits a change held by another owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    /// Item uid at the reporting member. `None` for changes the engine
    /// synthesized for a member that has not assigned a uid yet.
    pub uid: Option<String>,
    /// Object type, e.g. `contact`.
    pub objtype: String,
    /// Name of the format the payload is encoded in.
    pub format: String,
    /// Payload.
    pub data: Option<Vec<u8>>,
    /// Change classification.
    pub changetype: ChangeType,
    /// Opaque comparison token from the member's change detection.
    pub hash: Option<String>,
    /// Last modification time in seconds since the epoch, if known.
    pub revision: Option<i64>,
}

impl Change {
    /// Creates a change without payload.
    pub fn new(uid: impl Into<String>, objtype: impl Into<String>, changetype: ChangeType) -> Self {
        Self {
            uid: Some(uid.into()),
            objtype: objtype.into(),
            format: String::new(),
            data: None,
            changetype,
            hash: None,
            revision: None,
        }
    }

    /// Creates an empty `Unknown` change with no uid.
    pub fn placeholder(objtype: impl Into<String>) -> Self {
        Self {
            uid: None,
            objtype: objtype.into(),
            format: String::new(),
            data: None,
            changetype: ChangeType::Unknown,
            hash: None,
            revision: None,
        }
    }

    /// Sets the payload and its format.
    pub fn with_data(mut self, format: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        self.format = format.into();
        self.data = Some(data.into());
        self
    }

    /// Sets the comparison hash.
    pub fn with_hash(mut self, hash: impl Into<String>) -> Self {
        self.hash = Some(hash.into());
        self
    }

    /// Sets the revision timestamp.
    pub fn with_revision(mut self, revision: i64) -> Self {
        self.revision = Some(revision);
        self
    }

    /// Returns the uid as a string slice.
    pub fn uid(&self) -> Option<&str> {
        self.uid.as_deref()
    }

    /// Returns true if the change carries a payload.
    pub fn has_data(&self) -> bool {
        self.data.is_some()
    }

    /// Copies payload, format and revision from `master`, keeping this
    /// change's uid and objtype.
    pub fn adopt_payload(&mut self, master: &Change) {
        self.format.clone_from(&master.format);
        self.data.clone_from(&master.data);
        self.hash.clone_from(&master.hash);
        self.revision = master.revision;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn changetype_codes_roundtrip() {
        for ty in [
            ChangeType::Unknown,
            ChangeType::Added,
            ChangeType::Modified,
            ChangeType::Deleted,
        ] {
            assert_eq!(ChangeType::from_code(ty.to_code()), Some(ty));
        }
        assert_eq!(ChangeType::from_code(42), None);
    }

    #[test]
    fn placeholder_is_unknown() {
        let change = Change::placeholder("contact");
        assert!(!change.changetype.is_known());
        assert!(change.uid().is_none());
        assert!(!change.has_data());
    }

    #[test]
    fn adopt_payload_keeps_identity() {
        let master = Change::new("a1", "contact", ChangeType::Added)
            .with_data("plain", b"alice".to_vec())
            .with_revision(10);
        let mut target = Change::new("b7", "contact", ChangeType::Modified);

        target.adopt_payload(&master);

        assert_eq!(target.uid(), Some("b7"));
        assert_eq!(target.changetype, ChangeType::Modified);
        assert_eq!(target.data.as_deref(), Some(&b"alice"[..]));
        assert_eq!(target.revision, Some(10));
    }
}
