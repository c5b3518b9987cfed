//! Phase completion tracking.
//!
//! Every phase is fanned out to N participants (members of an object type,
//! or object types of a group). A phase is settled once each participant
//! either finished it or has errored at some point during the session.

/// Sync phases, in session order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Open the connection to the member.
    Connect,
    /// Fetch changes.
    Read,
    /// Commit propagated changes.
    Write,
    /// Tell members the sync completed.
    SyncDone,
    /// Close the connection.
    Disconnect,
}

impl Phase {
    const ALL: [Phase; 5] = [
        Phase::Connect,
        Phase::Read,
        Phase::Write,
        Phase::SyncDone,
        Phase::Disconnect,
    ];

    fn index(self) -> usize {
        match self {
            Phase::Connect => 0,
            Phase::Read => 1,
            Phase::Write => 2,
            Phase::SyncDone => 3,
            Phase::Disconnect => 4,
        }
    }

    /// Returns the verb used in error messages.
    pub fn verb(self) -> &'static str {
        match self {
            Phase::Connect => "connected",
            Phase::Read => "read",
            Phase::Write => "written",
            Phase::SyncDone => "sync_done",
            Phase::Disconnect => "disconnected",
        }
    }
}

/// A fixed-size set of participant positions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionSet {
    bits: Vec<bool>,
}

impl CompletionSet {
    /// Creates an empty set for `len` participants.
    pub fn new(len: usize) -> Self {
        Self {
            bits: vec![false; len],
        }
    }

    /// Adds a participant. Out-of-range positions are ignored.
    pub fn insert(&mut self, pos: usize) {
        if let Some(bit) = self.bits.get_mut(pos) {
            *bit = true;
        }
    }

    /// Returns true if `pos` is in the set.
    pub fn contains(&self, pos: usize) -> bool {
        self.bits.get(pos).copied().unwrap_or(false)
    }

    /// Number of participants in the set.
    pub fn count(&self) -> usize {
        self.bits.iter().filter(|b| **b).count()
    }

    /// Number of participants in either set.
    pub fn union_count(&self, other: &CompletionSet) -> usize {
        self.bits
            .iter()
            .zip(other.bits.iter())
            .filter(|(a, b)| **a || **b)
            .count()
    }

    /// Number of participants tracked.
    pub fn len(&self) -> usize {
        self.bits.len()
    }

    /// Returns true if no participants are tracked.
    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }
}

/// Per-phase completion and error sets for N participants.
#[derive(Debug, Clone)]
pub struct PhaseTracker {
    errors: CompletionSet,
    done: [CompletionSet; 5],
}

impl PhaseTracker {
    /// Creates a tracker for `len` participants.
    pub fn new(len: usize) -> Self {
        Self {
            errors: CompletionSet::new(len),
            done: Phase::ALL.map(|_| CompletionSet::new(len)),
        }
    }

    /// Number of participants.
    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// Returns true if the tracker has no participants.
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Records that `pos` finished `phase`.
    pub fn mark_done(&mut self, phase: Phase, pos: usize) {
        self.done[phase.index()].insert(pos);
    }

    /// Records that `pos` failed.
    pub fn mark_error(&mut self, pos: usize) {
        self.errors.insert(pos);
    }

    /// Returns true if `pos` failed during this session.
    pub fn is_error(&self, pos: usize) -> bool {
        self.errors.contains(pos)
    }

    /// Returns true if `pos` finished `phase`.
    pub fn is_done(&self, phase: Phase, pos: usize) -> bool {
        self.done[phase.index()].contains(pos)
    }

    /// Number of participants that finished `phase`.
    pub fn completed(&self, phase: Phase) -> usize {
        self.done[phase.index()].count()
    }

    /// All of N participants finished `phase` or errored.
    pub fn is_settled(&self, phase: Phase) -> bool {
        self.errors.union_count(&self.done[phase.index()]) == self.len()
    }

    /// Fewer participants finished `phase` than connected.
    pub fn fell_short(&self, phase: Phase) -> bool {
        self.completed(phase) < self.completed(Phase::Connect)
    }

    /// Every participant errored.
    pub fn all_errored(&self) -> bool {
        self.errors.count() == self.len()
    }

    /// Clears all sets.
    pub fn reset(&mut self) {
        *self = Self::new(self.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn disconnect_waits_for_every_connected_member() {
        let mut tracker = PhaseTracker::new(3);
        for pos in 0..3 {
            tracker.mark_done(Phase::Connect, pos);
        }
        tracker.mark_done(Phase::Disconnect, 0);
        tracker.mark_done(Phase::Disconnect, 1);
        assert!(!tracker.is_settled(Phase::Disconnect));

        tracker.mark_error(2);
        assert!(tracker.is_settled(Phase::Disconnect));
        assert!(tracker.fell_short(Phase::Disconnect));
    }

    #[test]
    fn late_disconnect_settles_without_shortfall() {
        let mut tracker = PhaseTracker::new(3);
        for pos in 0..3 {
            tracker.mark_done(Phase::Connect, pos);
            tracker.mark_done(Phase::Disconnect, pos);
        }
        assert!(tracker.is_settled(Phase::Disconnect));
        assert!(!tracker.fell_short(Phase::Disconnect));
    }

    #[test]
    fn errors_count_for_every_phase() {
        let mut tracker = PhaseTracker::new(2);
        tracker.mark_error(0);
        tracker.mark_done(Phase::Connect, 1);
        assert!(tracker.is_settled(Phase::Connect));
        assert!(!tracker.is_settled(Phase::Read));
        tracker.mark_done(Phase::Read, 1);
        assert!(tracker.is_settled(Phase::Read));
        assert!(!tracker.all_errored());

        tracker.mark_error(1);
        assert!(tracker.all_errored());
        tracker.reset();
        assert!(!tracker.is_error(0));
        assert_eq!(tracker.completed(Phase::Connect), 0);
    }

    #[test]
    fn empty_tracker_is_settled() {
        let tracker = PhaseTracker::new(0);
        assert!(tracker.is_empty());
        assert!(tracker.is_settled(Phase::Connect));
    }

    #[test]
    fn out_of_range_is_ignored() {
        let mut set = CompletionSet::new(2);
        set.insert(5);
        assert_eq!(set.count(), 0);
        assert!(!set.contains(5));
    }

    proptest! {
        #[test]
        fn settled_iff_every_position_covered(
            done in proptest::collection::vec(any::<bool>(), 0..40),
            errored in proptest::collection::vec(any::<bool>(), 0..40),
        ) {
            let len = done.len().min(errored.len());
            let mut tracker = PhaseTracker::new(len);
            for pos in 0..len {
                if done[pos] {
                    tracker.mark_done(Phase::Write, pos);
                }
                if errored[pos] {
                    tracker.mark_error(pos);
                }
            }
            let covered = (0..len).all(|pos| done[pos] || errored[pos]);
            prop_assert_eq!(tracker.is_settled(Phase::Write), covered);
        }
    }
}
