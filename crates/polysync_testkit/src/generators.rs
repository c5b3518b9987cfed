//! Property-based test generators using proptest.
//!
//! Payloads are drawn from a small alphabet so that generated entries
//! collide often enough to exercise both the synced and conflicted paths.

use crate::fixtures::plain_change;
use polysync_types::{Change, ChangeType};
use proptest::prelude::*;

/// Strategy for changetypes a member may report.
pub fn changetype_strategy() -> impl Strategy<Value = ChangeType> {
    prop_oneof![
        Just(ChangeType::Added),
        Just(ChangeType::Modified),
        Just(ChangeType::Deleted),
    ]
}

/// Strategy for short payloads with frequent repeats.
pub fn payload_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[xyz]{1,2}").expect("Invalid regex")
}

/// Strategy for member uids.
pub fn uid_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9]{0,7}").expect("Invalid regex")
}

/// Strategy for a reported change of `objtype`, optionally with a revision.
pub fn change_strategy(objtype: &'static str) -> impl Strategy<Value = Change> {
    (
        uid_strategy(),
        changetype_strategy(),
        payload_strategy(),
        proptest::option::of(0i64..16),
    )
        .prop_map(move |(uid, changetype, payload, revision)| {
            let change = plain_change(&uid, objtype, changetype, &payload);
            match revision {
                Some(revision) => change.with_revision(revision),
                None => change,
            }
        })
}

/// Strategy for the entries of one mapping: per member, the change it
/// reported, if any.
pub fn mapping_entries_strategy(
    objtype: &'static str,
    members: usize,
) -> impl Strategy<Value = Vec<Option<Change>>> {
    prop::collection::vec(proptest::option::weighted(0.8, change_strategy(objtype)), members)
}

/// Strategy for entries that all carry data and a revision, for
/// latest-wins checks.
pub fn revisioned_entries_strategy(
    objtype: &'static str,
    members: usize,
) -> impl Strategy<Value = Vec<Change>> {
    prop::collection::vec(
        (uid_strategy(), payload_strategy(), 0i64..8).prop_map(move |(uid, payload, revision)| {
            plain_change(&uid, objtype, ChangeType::Modified, &payload).with_revision(revision)
        }),
        members,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #[test]
        fn deletions_have_no_payload(change in change_strategy("contact")) {
            prop_assert_eq!(change.changetype == ChangeType::Deleted, !change.has_data());
        }

        #[test]
        fn entries_match_member_count(entries in mapping_entries_strategy("contact", 3)) {
            prop_assert_eq!(entries.len(), 3);
        }
    }
}
