//! Scripted in-memory member proxy.
//!
//! A [`MockMember`] is handed to the engine; the paired [`MockHandle`] stays
//! with the test to script reports, inject failures and inspect what the
//! engine committed. Both share one state, so a member keeps its items
//! across engine instances.

use parking_lot::Mutex;
use polysync_engine::{
    ChangesReply, CommitReply, DiscoverReply, EngineError, EngineResult, FinalizeReply,
    MemberProxy, PhaseReply,
};
use polysync_types::{Change, ChangeType, MemberId};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::thread;
use tracing::trace;

/// Format name used for mock payloads.
pub const MOCK_FORMAT: &str = "plain";

/// Operations a mock member answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    /// `connect`
    Connect,
    /// `get_changes`
    GetChanges,
    /// `commit_change`
    Commit,
    /// `committed_all`
    CommittedAll,
    /// `sync_done`
    SyncDone,
    /// `disconnect`
    Disconnect,
    /// `discover`
    Discover,
    /// `finalize`
    Finalize,
}

/// One recorded proxy call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCall {
    /// Operation.
    pub op: MockOp,
    /// Object type, `None` for the member as a whole.
    pub objtype: Option<String>,
}

#[derive(Debug)]
struct MockState {
    name: String,
    pending: HashMap<String, Vec<Change>>,
    store: BTreeMap<(String, String), Change>,
    commits: Vec<Change>,
    calls: Vec<MockCall>,
    failures: Vec<(MockOp, Option<String>)>,
    readable: bool,
    next_uid: u64,
    discovered: Vec<String>,
    threaded: bool,
    hold_finalize: bool,
    held: Vec<FinalizeReply>,
    last_slow_sync: Option<bool>,
}

impl MockState {
    fn record(&mut self, op: MockOp, objtype: Option<&str>) -> EngineResult<()> {
        trace!(member = %self.name, ?op, ?objtype, "mock call");
        self.calls.push(MockCall {
            op,
            objtype: objtype.map(str::to_string),
        });
        let failing = self.failures.iter().any(|(fail_op, fail_objtype)| {
            *fail_op == op && (fail_objtype.is_none() || fail_objtype.as_deref() == objtype)
        });
        if failing {
            Err(EngineError::generic(format!("{} failed {op:?}", self.name)))
        } else {
            Ok(())
        }
    }

    fn apply(&mut self, change: &Change) -> EngineResult<Option<String>> {
        let objtype = change.objtype.clone();
        match change.changetype {
            ChangeType::Added => {
                self.next_uid += 1;
                let uid = format!("{}-{}", self.name, self.next_uid);
                let mut stored = change.clone();
                stored.uid = Some(uid.clone());
                self.store.insert((objtype, uid.clone()), stored);
                Ok(Some(uid))
            }
            ChangeType::Modified => {
                let uid = change
                    .uid
                    .clone()
                    .ok_or_else(|| EngineError::generic("modified change without uid"))?;
                self.store.insert((objtype, uid), change.clone());
                Ok(None)
            }
            ChangeType::Deleted => {
                if let Some(uid) = change.uid.clone() {
                    self.store.remove(&(objtype, uid));
                }
                Ok(None)
            }
            ChangeType::Unknown => Err(EngineError::generic("cannot commit an unknown change")),
        }
    }
}

/// Member proxy backed by a shared [`MockHandle`] state.
#[derive(Debug)]
pub struct MockMember {
    id: MemberId,
    state: Arc<Mutex<MockState>>,
}

impl MockMember {
    /// Creates a member and the handle controlling it.
    pub fn new(id: MemberId, name: impl Into<String>) -> (Self, MockHandle) {
        let state = Arc::new(Mutex::new(MockState {
            name: name.into(),
            pending: HashMap::new(),
            store: BTreeMap::new(),
            commits: Vec::new(),
            calls: Vec::new(),
            failures: Vec::new(),
            readable: true,
            next_uid: 0,
            discovered: Vec::new(),
            threaded: false,
            hold_finalize: false,
            held: Vec::new(),
            last_slow_sync: None,
        }));
        let handle = MockHandle {
            id,
            state: Arc::clone(&state),
        };
        (Self { id, state }, handle)
    }

    fn dispatch(&self, answer: impl FnOnce() + Send + 'static) {
        if self.state.lock().threaded {
            thread::spawn(answer);
        } else {
            answer();
        }
    }

    fn phase(&self, op: MockOp, objtype: Option<&str>, reply: PhaseReply) {
        let result = self.state.lock().record(op, objtype);
        self.dispatch(move || reply.done(result));
    }
}

impl MemberProxy for MockMember {
    fn member_id(&self) -> MemberId {
        self.id
    }

    fn connect(&mut self, objtype: Option<&str>, slow_sync: bool, reply: PhaseReply) {
        self.state.lock().last_slow_sync = Some(slow_sync);
        self.phase(MockOp::Connect, objtype, reply);
    }

    fn get_changes(&mut self, objtype: Option<&str>, slow_sync: bool, reply: ChangesReply) {
        let (result, changes) = {
            let mut state = self.state.lock();
            let result = state.record(MockOp::GetChanges, objtype);
            let changes = match (objtype, &result) {
                (Some(objtype), Ok(())) => {
                    let pending = state.pending.remove(objtype).unwrap_or_default();
                    if slow_sync {
                        let mut all: Vec<Change> = state
                            .store
                            .iter()
                            .filter(|((ot, uid), _)| {
                                ot == objtype && !pending.iter().any(|c| c.uid() == Some(uid.as_str()))
                            })
                            .map(|(_, change)| {
                                let mut change = change.clone();
                                change.changetype = ChangeType::Added;
                                change
                            })
                            .collect();
                        all.extend(pending);
                        all
                    } else {
                        pending
                    }
                }
                _ => Vec::new(),
            };
            (result, changes)
        };
        self.dispatch(move || {
            for change in changes {
                reply.report(change);
            }
            reply.done(result);
        });
    }

    fn commit_change(&mut self, change: Change, reply: CommitReply) {
        let result = {
            let mut state = self.state.lock();
            let result = state
                .record(MockOp::Commit, Some(&change.objtype))
                .and_then(|()| state.apply(&change));
            if result.is_ok() {
                state.commits.push(change);
            }
            result
        };
        self.dispatch(move || reply.done(result));
    }

    fn committed_all(&mut self, objtype: Option<&str>, reply: PhaseReply) {
        self.phase(MockOp::CommittedAll, objtype, reply);
    }

    fn sync_done(&mut self, objtype: Option<&str>, reply: PhaseReply) {
        self.phase(MockOp::SyncDone, objtype, reply);
    }

    fn disconnect(&mut self, objtype: Option<&str>, reply: PhaseReply) {
        self.phase(MockOp::Disconnect, objtype, reply);
    }

    fn can_read(&self, _objtype: &str) -> bool {
        self.state.lock().readable
    }

    fn discover(&mut self, reply: DiscoverReply) {
        let result = {
            let mut state = self.state.lock();
            state
                .record(MockOp::Discover, None)
                .map(|()| state.discovered.clone())
        };
        self.dispatch(move || reply.done(result));
    }

    fn finalize(&mut self, reply: FinalizeReply) {
        let mut state = self.state.lock();
        let result = state.record(MockOp::Finalize, None);
        if state.hold_finalize {
            state.held.push(reply);
            return;
        }
        drop(state);
        self.dispatch(move || reply.done(result));
    }
}

/// Test-side control of a [`MockMember`].
#[derive(Debug, Clone)]
pub struct MockHandle {
    id: MemberId,
    state: Arc<Mutex<MockState>>,
}

impl MockHandle {
    /// Member id.
    pub fn id(&self) -> MemberId {
        self.id
    }

    /// Creates another proxy sharing this member's state.
    pub fn proxy(&self) -> MockMember {
        MockMember {
            id: self.id,
            state: Arc::clone(&self.state),
        }
    }

    /// Queues a change for the next `get_changes` of its object type.
    pub fn report(&self, change: Change) {
        self.state
            .lock()
            .pending
            .entry(change.objtype.clone())
            .or_default()
            .push(change);
    }

    /// Stores a new item and reports it as added.
    pub fn add(&self, objtype: &str, uid: &str, data: &str) {
        self.store_and_report(Change::new(uid, objtype, ChangeType::Added).with_data(MOCK_FORMAT, data));
    }

    /// Changes an item and reports it as modified.
    pub fn modify(&self, objtype: &str, uid: &str, data: &str) {
        self.store_and_report(
            Change::new(uid, objtype, ChangeType::Modified).with_data(MOCK_FORMAT, data),
        );
    }

    /// Changes an item at `revision` and reports it as modified.
    pub fn modify_at(&self, objtype: &str, uid: &str, data: &str, revision: i64) {
        self.store_and_report(
            Change::new(uid, objtype, ChangeType::Modified)
                .with_data(MOCK_FORMAT, data)
                .with_revision(revision),
        );
    }

    /// Removes an item and reports it as deleted.
    pub fn delete(&self, objtype: &str, uid: &str) {
        let mut state = self.state.lock();
        state.store.remove(&(objtype.to_string(), uid.to_string()));
        state
            .pending
            .entry(objtype.to_string())
            .or_default()
            .push(Change::new(uid, objtype, ChangeType::Deleted));
    }

    fn store_and_report(&self, change: Change) {
        if let Some(uid) = change.uid.clone() {
            self.state
                .lock()
                .store
                .insert((change.objtype.clone(), uid), change.clone());
        }
        self.report(change);
    }

    /// Items of `objtype`, ordered by uid.
    pub fn items(&self, objtype: &str) -> Vec<Change> {
        self.state
            .lock()
            .store
            .iter()
            .filter(|((ot, _), _)| ot == objtype)
            .map(|(_, change)| change.clone())
            .collect()
    }

    /// Payload of one item.
    pub fn data(&self, objtype: &str, uid: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .store
            .get(&(objtype.to_string(), uid.to_string()))
            .and_then(|change| change.data.clone())
    }

    /// Payloads of every item of `objtype`, sorted.
    pub fn payloads(&self, objtype: &str) -> Vec<String> {
        let mut payloads: Vec<String> = self
            .items(objtype)
            .iter()
            .filter_map(|change| change.data.as_deref())
            .map(|data| String::from_utf8_lossy(data).into_owned())
            .collect();
        payloads.sort();
        payloads
    }

    /// Changes committed by the engine, in order.
    pub fn commits(&self) -> Vec<Change> {
        self.state.lock().commits.clone()
    }

    /// Every call received, in order.
    pub fn calls(&self) -> Vec<MockCall> {
        self.state.lock().calls.clone()
    }

    /// Number of calls of `op`.
    pub fn count(&self, op: MockOp) -> usize {
        self.state.lock().calls.iter().filter(|c| c.op == op).count()
    }

    /// Fails `op` for `objtype`, or for every scope if `None`.
    pub fn fail_on(&self, op: MockOp, objtype: Option<&str>) {
        self.state
            .lock()
            .failures
            .push((op, objtype.map(str::to_string)));
    }

    /// Removes every injected failure.
    pub fn clear_failures(&self) {
        self.state.lock().failures.clear();
    }

    /// Sets whether the member can re-read single items.
    pub fn set_readable(&self, readable: bool) {
        self.state.lock().readable = readable;
    }

    /// Sets the object types reported by discovery.
    pub fn set_discovered(&self, objtypes: &[&str]) {
        self.state.lock().discovered = objtypes.iter().map(|s| s.to_string()).collect();
    }

    /// Answers from a worker thread instead of the calling thread.
    pub fn set_threaded(&self, threaded: bool) {
        self.state.lock().threaded = threaded;
    }

    /// Keeps finalize requests unanswered until released.
    pub fn hold_finalize(&self, hold: bool) {
        self.state.lock().hold_finalize = hold;
    }

    /// Answers held finalize requests.
    pub fn release_finalize(&self) {
        let held = std::mem::take(&mut self.state.lock().held);
        for reply in held {
            reply.done(Ok(()));
        }
    }

    /// The `slow_sync` flag of the latest connect.
    pub fn last_slow_sync(&self) -> Option<bool> {
        self.state.lock().last_slow_sync
    }
}
