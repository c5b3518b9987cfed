//! Member proxy interface.
//!
//! A member proxy is the engine's handle on one backend. Every request
//! carries a reply object; the proxy answers by consuming it, either on the
//! calling thread or later from any other thread. Answers are posted to the
//! engine's queue and processed on the engine thread.
//!
//! `objtype == None` addresses the member as a whole (the group-level
//! connection); `Some(objtype)` addresses its sink for that object type.

use crate::command::Message;
use crate::error::{EngineError, EngineResult};
use crate::phase::Phase;
use polysync_types::{Change, MemberId};
use std::sync::mpsc::Sender;
use tracing::debug;

/// A backend participating in synchronization.
pub trait MemberProxy: Send {
    /// Id of the member this proxy serves.
    fn member_id(&self) -> MemberId;

    /// Opens the connection. `slow_sync` asks the member to report every
    /// item instead of only the changed ones.
    fn connect(&mut self, objtype: Option<&str>, slow_sync: bool, reply: PhaseReply);

    /// Streams changes through `reply.report` and then completes.
    fn get_changes(&mut self, objtype: Option<&str>, slow_sync: bool, reply: ChangesReply);

    /// Writes one change. Completes with the uid the member assigned, if any.
    fn commit_change(&mut self, change: Change, reply: CommitReply);

    /// Signals that every change of this batch was committed.
    fn committed_all(&mut self, objtype: Option<&str>, reply: PhaseReply);

    /// Signals that the sync completed.
    fn sync_done(&mut self, objtype: Option<&str>, reply: PhaseReply);

    /// Closes the connection.
    fn disconnect(&mut self, objtype: Option<&str>, reply: PhaseReply);

    /// Whether the member can re-read single items of `objtype`.
    fn can_read(&self, _objtype: &str) -> bool {
        false
    }

    /// Reports which object types the member supports.
    fn discover(&mut self, reply: DiscoverReply) {
        reply.done(Ok(Vec::new()));
    }

    /// Releases the member's resources.
    fn finalize(&mut self, reply: FinalizeReply) {
        reply.done(Ok(()));
    }
}

/// Who a reply is addressed to inside the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Scope {
    Group,
    ObjType(usize),
}

/// An answer from a proxy, delivered on the engine thread.
#[derive(Debug)]
pub(crate) struct ProxyEvent {
    pub(crate) session: u64,
    pub(crate) member: usize,
    pub(crate) scope: Scope,
    pub(crate) kind: ProxyEventKind,
}

#[derive(Debug)]
pub(crate) enum ProxyEventKind {
    Finished {
        phase: Phase,
        result: EngineResult<()>,
    },
    Change(Change),
    Committed {
        mapping: usize,
        result: EngineResult<Option<String>>,
    },
    Discovered(EngineResult<Vec<String>>),
    Finalized(EngineResult<()>),
}

/// Posts answers; answers with `fallback` if dropped unanswered.
#[derive(Debug)]
struct Outbox {
    tx: Sender<Message>,
    session: u64,
    member: usize,
    scope: Scope,
    fallback: Option<ProxyEventKind>,
}

impl Outbox {
    fn new(
        tx: Sender<Message>,
        session: u64,
        member: usize,
        scope: Scope,
        fallback: ProxyEventKind,
    ) -> Self {
        Self {
            tx,
            session,
            member,
            scope,
            fallback: Some(fallback),
        }
    }

    fn post(&self, kind: ProxyEventKind) {
        let event = ProxyEvent {
            session: self.session,
            member: self.member,
            scope: self.scope,
            kind,
        };
        if self.tx.send(Message::Proxy(event)).is_err() {
            debug!(member = self.member, "engine gone, dropping proxy answer");
        }
    }

    fn complete(&mut self, kind: ProxyEventKind) {
        self.fallback = None;
        self.post(kind);
    }
}

impl Drop for Outbox {
    fn drop(&mut self) {
        if let Some(kind) = self.fallback.take() {
            self.post(kind);
        }
    }
}

fn unanswered() -> EngineError {
    EngineError::generic("member dropped the request without answering")
}

/// Completion of connect, committed_all, sync_done and disconnect.
#[derive(Debug)]
pub struct PhaseReply {
    outbox: Outbox,
    phase: Phase,
}

impl PhaseReply {
    pub(crate) fn new(
        tx: Sender<Message>,
        session: u64,
        member: usize,
        scope: Scope,
        phase: Phase,
    ) -> Self {
        let fallback = ProxyEventKind::Finished {
            phase,
            result: Err(unanswered()),
        };
        Self {
            outbox: Outbox::new(tx, session, member, scope, fallback),
            phase,
        }
    }

    /// Completes the request.
    pub fn done(mut self, result: EngineResult<()>) {
        let phase = self.phase;
        self.outbox.complete(ProxyEventKind::Finished { phase, result });
    }

    /// Completes the request successfully.
    pub fn ok(self) {
        self.done(Ok(()));
    }

    /// Returns the phase being answered.
    pub fn phase(&self) -> Phase {
        self.phase
    }
}

/// Completion of `get_changes`, with the stream of reported changes.
#[derive(Debug)]
pub struct ChangesReply {
    outbox: Outbox,
}

impl ChangesReply {
    pub(crate) fn new(tx: Sender<Message>, session: u64, member: usize, scope: Scope) -> Self {
        let fallback = ProxyEventKind::Finished {
            phase: Phase::Read,
            result: Err(unanswered()),
        };
        Self {
            outbox: Outbox::new(tx, session, member, scope, fallback),
        }
    }

    /// Reports one change.
    pub fn report(&self, change: Change) {
        self.outbox.post(ProxyEventKind::Change(change));
    }

    /// Completes the request.
    pub fn done(mut self, result: EngineResult<()>) {
        self.outbox.complete(ProxyEventKind::Finished {
            phase: Phase::Read,
            result,
        });
    }
}

/// Completion of `commit_change`.
#[derive(Debug)]
pub struct CommitReply {
    outbox: Outbox,
    mapping: usize,
}

impl CommitReply {
    pub(crate) fn new(
        tx: Sender<Message>,
        session: u64,
        member: usize,
        scope: Scope,
        mapping: usize,
    ) -> Self {
        let fallback = ProxyEventKind::Committed {
            mapping,
            result: Err(unanswered()),
        };
        Self {
            outbox: Outbox::new(tx, session, member, scope, fallback),
            mapping,
        }
    }

    /// Completes the commit with the uid assigned by the member, if any.
    pub fn done(mut self, result: EngineResult<Option<String>>) {
        let mapping = self.mapping;
        self.outbox
            .complete(ProxyEventKind::Committed { mapping, result });
    }
}

/// Completion of `discover`.
#[derive(Debug)]
pub struct DiscoverReply {
    outbox: Outbox,
}

impl DiscoverReply {
    pub(crate) fn new(tx: Sender<Message>, session: u64, member: usize) -> Self {
        let fallback = ProxyEventKind::Discovered(Err(unanswered()));
        Self {
            outbox: Outbox::new(tx, session, member, Scope::Group, fallback),
        }
    }

    /// Completes discovery with the object types the member supports.
    pub fn done(mut self, result: EngineResult<Vec<String>>) {
        self.outbox.complete(ProxyEventKind::Discovered(result));
    }
}

/// Completion of `finalize`.
#[derive(Debug)]
pub struct FinalizeReply {
    outbox: Outbox,
}

impl FinalizeReply {
    pub(crate) fn new(tx: Sender<Message>, session: u64, member: usize) -> Self {
        let fallback = ProxyEventKind::Finalized(Err(unanswered()));
        Self {
            outbox: Outbox::new(tx, session, member, Scope::Group, fallback),
        }
    }

    /// Completes finalization.
    pub fn done(mut self, result: EngineResult<()>) {
        self.outbox.complete(ProxyEventKind::Finalized(result));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn next_event(rx: &mpsc::Receiver<Message>) -> ProxyEvent {
        match rx.try_recv().unwrap() {
            Message::Proxy(event) => event,
            _ => panic!("expected a proxy event"),
        }
    }

    #[test]
    fn phase_reply_posts_result() {
        let (tx, rx) = mpsc::channel();
        PhaseReply::new(tx, 3, 1, Scope::ObjType(0), Phase::Connect).ok();

        let event = next_event(&rx);
        assert_eq!(event.session, 3);
        assert_eq!(event.member, 1);
        assert_eq!(event.scope, Scope::ObjType(0));
        assert!(matches!(
            event.kind,
            ProxyEventKind::Finished {
                phase: Phase::Connect,
                result: Ok(())
            }
        ));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn dropped_reply_reports_error() {
        let (tx, rx) = mpsc::channel();
        drop(PhaseReply::new(tx, 1, 0, Scope::Group, Phase::Disconnect));

        let event = next_event(&rx);
        assert!(matches!(
            event.kind,
            ProxyEventKind::Finished {
                phase: Phase::Disconnect,
                result: Err(_)
            }
        ));
    }

    #[test]
    fn changes_stream_before_completion() {
        let (tx, rx) = mpsc::channel();
        let reply = ChangesReply::new(tx, 1, 2, Scope::ObjType(1));
        reply.report(Change::new("a", "note", polysync_types::ChangeType::Added));
        reply.done(Ok(()));

        assert!(matches!(next_event(&rx).kind, ProxyEventKind::Change(_)));
        assert!(matches!(
            next_event(&rx).kind,
            ProxyEventKind::Finished {
                phase: Phase::Read,
                result: Ok(())
            }
        ));
    }

    #[test]
    fn reply_from_another_thread() {
        let (tx, rx) = mpsc::channel();
        let reply = CommitReply::new(tx, 1, 0, Scope::ObjType(0), 7);
        std::thread::spawn(move || reply.done(Ok(Some("uid".into()))))
            .join()
            .unwrap();

        match next_event(&rx).kind {
            ProxyEventKind::Committed { mapping, result } => {
                assert_eq!(mapping, 7);
                assert_eq!(result.unwrap().as_deref(), Some("uid"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
