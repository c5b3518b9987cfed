//! Engine queue messages and conflict resolution handles.

use crate::error::{EngineError, EngineResult};
use crate::proxy::ProxyEvent;
use polysync_types::MemberId;
use std::sync::mpsc::Sender;

/// Identifies a mapping within the session that reported it.
///
/// Handles from an earlier session are rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MappingRef {
    pub(crate) session: u64,
    pub(crate) objtype: usize,
    pub(crate) index: usize,
}

/// Requests accepted on the engine queue.
#[derive(Debug)]
pub(crate) enum Command {
    Connect,
    Solve {
        mapping: MappingRef,
        member_id: MemberId,
    },
    Duplicate(MappingRef),
    Ignore(MappingRef),
    UseLatest(MappingRef),
    Discover(MemberId),
    Abort,
}

/// Everything the engine thread consumes.
#[derive(Debug)]
pub(crate) enum Message {
    Command(Command),
    Proxy(ProxyEvent),
    Finalize,
}

pub(crate) fn send(tx: &Sender<Message>, command: Command) -> EngineResult<()> {
    tx.send(Message::Command(command))
        .map_err(|_| EngineError::Disconnected)
}

/// Enqueues a decision for one conflicted mapping.
///
/// Handed to the conflict callback; may be cloned and used from any thread.
#[derive(Debug, Clone)]
pub struct Resolver {
    tx: Sender<Message>,
    mapping: MappingRef,
}

impl Resolver {
    pub(crate) fn new(tx: Sender<Message>, mapping: MappingRef) -> Self {
        Self { tx, mapping }
    }

    /// The mapping this resolver decides for.
    pub fn mapping(&self) -> MappingRef {
        self.mapping
    }

    /// Makes the entry of `member_id` the master.
    pub fn solve(&self, member_id: MemberId) -> EngineResult<()> {
        send(
            &self.tx,
            Command::Solve {
                mapping: self.mapping,
                member_id,
            },
        )
    }

    /// Splits the mapping into one mapping per distinct value.
    pub fn duplicate(&self) -> EngineResult<()> {
        send(&self.tx, Command::Duplicate(self.mapping))
    }

    /// Leaves the mapping unsynchronized for this session.
    pub fn ignore(&self) -> EngineResult<()> {
        send(&self.tx, Command::Ignore(self.mapping))
    }

    /// Makes the most recently changed entry the master.
    pub fn use_latest(&self) -> EngineResult<()> {
        send(&self.tx, Command::UseLatest(self.mapping))
    }
}
