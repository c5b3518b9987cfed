//! The format collaborator.
//!
//! The engine never looks inside a payload. Comparing, converting and
//! disambiguating duplicates are delegated to a [`FormatEnv`].

use crate::change::Change;
use crate::error::{FormatError, FormatResult};
use crate::mapping::MemberId;

/// Outcome of comparing two changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareResult {
    /// Content-equal.
    Same,
    /// The same item, but the content differs.
    Similar,
    /// Unrelated items.
    Mismatch,
}

/// Target of a conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvertTarget {
    /// The engine's common format, applied to every incoming change.
    Internal,
    /// The native format of a member, applied before committing.
    Member(MemberId),
}

/// A change after one elevation step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Elevated {
    /// The elevated change.
    pub change: Change,
    /// Whether the member holding the original must be rewritten.
    pub dirty: bool,
}

/// Format-aware operations the engine consumes.
pub trait FormatEnv: Send + Sync {
    /// Compares two changes for content equality.
    fn compare(&self, left: &Change, right: &Change) -> CompareResult;

    /// Converts a change for `target`. The default is a plain clone.
    fn convert(&self, change: &Change, _target: ConvertTarget) -> FormatResult<Change> {
        Ok(change.clone())
    }

    /// Makes a change distinguishable from its duplicate sibling.
    fn elevate(&self, change: &Change) -> FormatResult<Elevated>;

    /// Extracts the revision timestamp of a change.
    fn revision(&self, change: &Change) -> FormatResult<Option<i64>> {
        Ok(change.revision)
    }
}

/// Byte-level format: payloads are equal iff their bytes are.
///
/// Two changes with the same uid but different bytes compare `Similar`.
/// Elevation appends a suffix to the uid.
#[derive(Debug, Clone)]
pub struct PlainFormat {
    elevation_suffix: String,
}

impl PlainFormat {
    /// Creates a plain format elevating with `-dupe`.
    pub fn new() -> Self {
        Self {
            elevation_suffix: "-dupe".to_string(),
        }
    }

    /// Sets the suffix appended to the uid on each elevation step.
    pub fn with_elevation_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.elevation_suffix = suffix.into();
        self
    }
}

impl Default for PlainFormat {
    fn default() -> Self {
        Self::new()
    }
}

impl FormatEnv for PlainFormat {
    fn compare(&self, left: &Change, right: &Change) -> CompareResult {
        if left.data == right.data {
            CompareResult::Same
        } else if left.uid.is_some() && left.uid == right.uid {
            CompareResult::Similar
        } else {
            CompareResult::Mismatch
        }
    }

    fn elevate(&self, change: &Change) -> FormatResult<Elevated> {
        let uid = change
            .uid()
            .ok_or_else(|| FormatError::Elevation("change has no uid".into()))?;
        let mut elevated = change.clone();
        elevated.uid = Some(format!("{uid}{}", self.elevation_suffix));
        Ok(Elevated {
            dirty: elevated.uid != change.uid,
            change: elevated,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::ChangeType;

    fn change(uid: &str, data: &str) -> Change {
        Change::new(uid, "note", ChangeType::Added).with_data("plain", data.as_bytes().to_vec())
    }

    #[test]
    fn compare_plain_payloads() {
        let format = PlainFormat::new();
        assert_eq!(format.compare(&change("a", "x"), &change("b", "x")), CompareResult::Same);
        assert_eq!(format.compare(&change("a", "x"), &change("a", "y")), CompareResult::Similar);
        assert_eq!(format.compare(&change("a", "x"), &change("b", "y")), CompareResult::Mismatch);
    }

    #[test]
    fn elevate_appends_suffix() {
        let format = PlainFormat::new();
        let once = format.elevate(&change("a", "x")).unwrap();
        assert!(once.dirty);
        assert_eq!(once.change.uid(), Some("a-dupe"));

        let twice = format.elevate(&once.change).unwrap();
        assert_eq!(twice.change.uid(), Some("a-dupe-dupe"));
    }

    #[test]
    fn empty_suffix_is_clean() {
        let format = PlainFormat::new().with_elevation_suffix("");
        let same = format.elevate(&change("a", "x")).unwrap();
        assert!(!same.dirty);
        assert_eq!(same.change.uid(), Some("a"));
    }

    #[test]
    fn elevate_without_uid_fails() {
        let format = PlainFormat::new();
        assert!(format.elevate(&Change::placeholder("note")).is_err());
    }

    #[test]
    fn default_revision_reads_field() {
        let format = PlainFormat::new();
        let c = change("a", "x").with_revision(77);
        assert_eq!(format.revision(&c).unwrap(), Some(77));
        assert_eq!(format.convert(&c, ConvertTarget::Member(3)).unwrap(), c);
    }
}
