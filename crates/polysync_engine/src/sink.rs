//! Sink engine: one member's participation in one object type.

use polysync_types::{Change, MemberId};

/// Connects a member proxy to an object type.
///
/// `entries` lists, in creation order, the mappings holding an entry of
/// this member, so routing a change never scans unrelated mappings.
#[derive(Debug, Clone)]
pub struct SinkEngine {
    proxy: usize,
    member_id: MemberId,
    entries: Vec<usize>,
    unmapped: Vec<Change>,
}

impl SinkEngine {
    /// Creates a sink for the proxy at position `proxy`.
    pub fn new(proxy: usize, member_id: MemberId) -> Self {
        Self {
            proxy,
            member_id,
            entries: Vec::new(),
            unmapped: Vec::new(),
        }
    }

    /// Position of the member proxy within the engine.
    pub fn proxy(&self) -> usize {
        self.proxy
    }

    /// Member.
    pub fn member_id(&self) -> MemberId {
        self.member_id
    }

    /// Mappings holding an entry of this member.
    pub fn entries(&self) -> &[usize] {
        &self.entries
    }

    pub(crate) fn register(&mut self, mapping: usize) {
        self.entries.push(mapping);
    }

    /// Changes not claimed by any existing mapping yet.
    pub fn unmapped(&self) -> &[Change] {
        &self.unmapped
    }

    pub(crate) fn park(&mut self, change: Change) {
        self.unmapped.push(change);
    }

    pub(crate) fn take_unmapped(&mut self) -> Vec<Change> {
        std::mem::take(&mut self.unmapped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use polysync_types::ChangeType;

    #[test]
    fn parked_changes_are_taken_once() {
        let mut sink = SinkEngine::new(1, 20);
        sink.park(Change::new("a", "note", ChangeType::Added));
        sink.park(Change::new("b", "note", ChangeType::Added));
        assert_eq!(sink.unmapped().len(), 2);

        assert_eq!(sink.take_unmapped().len(), 2);
        assert!(sink.unmapped().is_empty());
    }

    #[test]
    fn registered_entries_keep_order() {
        let mut sink = SinkEngine::new(0, 10);
        sink.register(3);
        sink.register(1);
        assert_eq!(sink.entries(), &[3, 1]);
        assert_eq!(sink.proxy(), 0);
        assert_eq!(sink.member_id(), 10);
    }
}
