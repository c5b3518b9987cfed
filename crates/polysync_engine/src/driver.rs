//! The engine thread.
//!
//! All engine state lives here and is touched by exactly one thread. Commands
//! from the `Engine` handle and answers from member proxies arrive on one
//! mpsc queue and are processed in order.
//!
//! Group phases join two trackers: the member proxies' group-level
//! connections and the object types. A group phase completes once both are
//! settled.

use crate::command::{Command, MappingRef, Message};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::obj_engine::{ObjEngine, ObjEvent, Resolution};
use crate::phase::{Phase, PhaseTracker};
use crate::proxy::{
    ChangesReply, DiscoverReply, FinalizeReply, MemberProxy, PhaseReply, ProxyEvent,
    ProxyEventKind, Scope,
};
use crate::status::{EngineEvent, EngineUpdate, MemberEvent, MemberUpdate, StatusHub};
use parking_lot::{Condvar, Mutex};
use polysync_archive::Archive;
use polysync_types::{FormatEnv, Group, MemberId};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// A member proxy owned by the engine thread.
pub(crate) struct ProxySlot {
    pub(crate) member_id: MemberId,
    pub(crate) proxy: Box<dyn MemberProxy>,
    pub(crate) finalized: bool,
}

impl std::fmt::Debug for ProxySlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxySlot")
            .field("member_id", &self.member_id)
            .field("finalized", &self.finalized)
            .finish()
    }
}

/// Resources shared by every object type of a session.
pub(crate) struct Env {
    pub(crate) proxies: Vec<ProxySlot>,
    pub(crate) archive: Archive,
    pub(crate) formats: Arc<dyn FormatEnv>,
    pub(crate) status: StatusHub,
    pub(crate) tx: Sender<Message>,
    pub(crate) convert: bool,
    pub(crate) slow_sync: bool,
    pub(crate) session: u64,
}

impl std::fmt::Debug for Env {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Env")
            .field("proxies", &self.proxies)
            .field("archive", &self.archive)
            .field("session", &self.session)
            .finish()
    }
}

#[derive(Debug, Default)]
struct Signal {
    generation: u64,
    running: bool,
    error: Option<EngineError>,
    discovered: Option<EngineResult<Vec<String>>>,
}

/// Wakeup state for blocking callers.
#[derive(Debug, Default)]
pub(crate) struct Shared {
    signal: Mutex<Signal>,
    cond: Condvar,
}

impl Shared {
    /// Marks a session as running and returns the generation to wait on.
    pub(crate) fn begin(&self) -> EngineResult<u64> {
        let mut signal = self.signal.lock();
        if signal.running {
            return Err(EngineError::Busy);
        }
        signal.running = true;
        signal.error = None;
        Ok(signal.generation)
    }

    /// Ends the running session.
    pub(crate) fn finish(&self, error: Option<EngineError>) {
        let mut signal = self.signal.lock();
        signal.running = false;
        signal.error = error;
        signal.generation += 1;
        self.cond.notify_all();
    }

    /// Blocks until the session started at `since` ended.
    pub(crate) fn wait(&self, since: u64) -> EngineResult<()> {
        let mut signal = self.signal.lock();
        while signal.generation == since {
            self.cond.wait(&mut signal);
        }
        match signal.error.take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Blocks until no session is running and returns the error of the
    /// last session, if nobody collected it yet.
    pub(crate) fn wait_idle(&self) -> EngineResult<()> {
        let since = {
            let mut signal = self.signal.lock();
            if !signal.running {
                return match signal.error.take() {
                    Some(error) => Err(error),
                    None => Ok(()),
                };
            }
            signal.generation
        };
        self.wait(since)
    }

    pub(crate) fn reset_discovered(&self) {
        self.signal.lock().discovered = None;
    }

    pub(crate) fn set_discovered(&self, result: EngineResult<Vec<String>>) {
        let mut signal = self.signal.lock();
        signal.discovered = Some(result);
        self.cond.notify_all();
    }

    /// Blocks until a discovery result arrives or `timeout` elapsed.
    pub(crate) fn wait_discovered(&self, timeout: Duration) -> EngineResult<Vec<String>> {
        let deadline = Instant::now() + timeout;
        let mut signal = self.signal.lock();
        loop {
            if let Some(result) = signal.discovered.take() {
                return result;
            }
            if self.cond.wait_until(&mut signal, deadline).timed_out() {
                return signal
                    .discovered
                    .take()
                    .unwrap_or_else(|| Err(EngineError::Timeout("waiting for discovery".into())));
            }
        }
    }
}

/// Enabled object types that at least two members support.
pub(crate) fn synchronizable_objtypes(group: &Group) -> Vec<String> {
    group
        .enabled_objtypes()
        .filter(|objtype| {
            group
                .members
                .iter()
                .filter(|member| member.supports(objtype))
                .count()
                >= 2
        })
        .map(str::to_string)
        .collect()
}

/// State owned by the engine thread.
#[derive(Debug)]
pub(crate) struct EngineCore {
    group: Group,
    config: EngineConfig,
    env: Env,
    shared: Arc<Shared>,
    objs: Vec<ObjEngine>,
    proxy_phases: PhaseTracker,
    obj_phases: PhaseTracker,
    phase: Option<Phase>,
    announced: Option<Phase>,
    error: Option<EngineError>,
}

impl EngineCore {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        group: Group,
        config: EngineConfig,
        proxies: Vec<Box<dyn MemberProxy>>,
        archive: Archive,
        formats: Arc<dyn FormatEnv>,
        status: StatusHub,
        shared: Arc<Shared>,
        tx: Sender<Message>,
        slow_sync: bool,
    ) -> Self {
        let proxies: Vec<ProxySlot> = proxies
            .into_iter()
            .map(|proxy| ProxySlot {
                member_id: proxy.member_id(),
                proxy,
                finalized: false,
            })
            .collect();
        let convert = config.convert_formats;
        Self {
            proxy_phases: PhaseTracker::new(proxies.len()),
            obj_phases: PhaseTracker::new(0),
            env: Env {
                proxies,
                archive,
                formats,
                status,
                tx,
                convert,
                slow_sync,
                session: 0,
            },
            group,
            config,
            shared,
            objs: Vec::new(),
            phase: None,
            announced: None,
            error: None,
        }
    }

    /// Runs until `Message::Finalize`.
    pub(crate) fn run(mut self, rx: Receiver<Message>) {
        info!(group = %self.group.name, "engine thread started");
        while let Ok(message) = rx.recv() {
            match message {
                Message::Command(command) => self.handle_command(command),
                Message::Proxy(event) => self.handle_proxy(event),
                Message::Finalize => {
                    self.finalize(&rx);
                    break;
                }
            }
        }
        info!(group = %self.group.name, "engine thread stopped");
    }

    fn handle_command(&mut self, command: Command) {
        debug!(?command, "engine command");
        match command {
            Command::Connect => self.connect(),
            Command::Solve { mapping, member_id } => {
                self.resolve(mapping, Resolution::Solve(member_id));
            }
            Command::Duplicate(mapping) => self.resolve(mapping, Resolution::Duplicate),
            Command::Ignore(mapping) => self.resolve(mapping, Resolution::Ignore),
            Command::UseLatest(mapping) => self.resolve(mapping, Resolution::UseLatest),
            Command::Discover(member_id) => self.discover(member_id),
            Command::Abort => self.abort(),
        }
    }

    fn record(&mut self, error: EngineError) {
        self.error = Some(error.stacked_on(self.error.take()));
    }

    fn emit(&self, event: EngineEvent) {
        let error = match event {
            EngineEvent::Error => self.error.as_ref().map(ToString::to_string),
            _ => None,
        };
        self.env.status.engine(EngineUpdate { event, error });
    }

    fn connect(&mut self) {
        if self.phase.is_some() {
            warn!("connect while a synchronization is running");
            return;
        }
        self.env.session += 1;
        self.error = None;

        let mut objs = Vec::new();
        for (index, objtype) in synchronizable_objtypes(&self.group).iter().enumerate() {
            match self.env.archive.load_changes(objtype) {
                Ok(rows) => objs.push(ObjEngine::new(index, objtype, &self.group.members, rows)),
                Err(error) => {
                    self.record(error.into());
                    self.emit(EngineEvent::Error);
                    self.shared.finish(self.error.take());
                    return;
                }
            }
        }
        if objs.is_empty() {
            self.record(EngineError::Misconfiguration("No synchronizable objtype".into()));
            self.emit(EngineEvent::Error);
            self.shared.finish(self.error.take());
            return;
        }

        self.objs = objs;
        self.proxy_phases = PhaseTracker::new(self.env.proxies.len());
        self.obj_phases = PhaseTracker::new(self.objs.len());
        self.phase = Some(Phase::Connect);
        self.announced = None;
        info!(
            session = self.env.session,
            objtypes = self.objs.len(),
            slow_sync = self.env.slow_sync,
            "synchronization started"
        );

        for obj in &mut self.objs {
            obj.connect(&mut self.env);
        }
        for pos in 0..self.env.proxies.len() {
            let reply = self.phase_reply(pos, Phase::Connect);
            let slow_sync = self.env.slow_sync;
            self.env.proxies[pos].proxy.connect(None, slow_sync, reply);
        }
        self.drain_obj_events();
        self.check_phase(Phase::Connect);
    }

    fn phase_reply(&self, pos: usize, phase: Phase) -> PhaseReply {
        PhaseReply::new(self.env.tx.clone(), self.env.session, pos, Scope::Group, phase)
    }

    fn enter_read(&mut self) {
        self.phase = Some(Phase::Read);
        for (index, obj) in self.objs.iter_mut().enumerate() {
            if !self.obj_phases.is_error(index) {
                obj.read(&mut self.env);
            }
        }
        for pos in 0..self.env.proxies.len() {
            if self.proxy_phases.is_error(pos) {
                continue;
            }
            let reply = ChangesReply::new(self.env.tx.clone(), self.env.session, pos, Scope::Group);
            let slow_sync = self.env.slow_sync;
            self.env.proxies[pos].proxy.get_changes(None, slow_sync, reply);
        }
        self.drain_obj_events();
        self.check_phase(Phase::Read);
    }

    fn enter_write(&mut self) {
        self.phase = Some(Phase::Write);
        for (index, obj) in self.objs.iter_mut().enumerate() {
            if !self.obj_phases.is_error(index) {
                obj.write(&mut self.env);
            }
        }
        for pos in 0..self.env.proxies.len() {
            if !self.proxy_phases.is_error(pos) {
                let reply = self.phase_reply(pos, Phase::Write);
                self.env.proxies[pos].proxy.committed_all(None, reply);
            }
        }
        self.drain_obj_events();
        self.check_phase(Phase::Write);
    }

    fn enter_sync_done(&mut self) {
        self.phase = Some(Phase::SyncDone);
        for (index, obj) in self.objs.iter_mut().enumerate() {
            if !self.obj_phases.is_error(index) {
                obj.sync_done(&mut self.env);
            }
        }
        for pos in 0..self.env.proxies.len() {
            if !self.proxy_phases.is_error(pos) {
                let reply = self.phase_reply(pos, Phase::SyncDone);
                self.env.proxies[pos].proxy.sync_done(None, reply);
            }
        }
        self.drain_obj_events();
        self.check_phase(Phase::SyncDone);
    }

    fn enter_disconnect(&mut self) {
        self.phase = Some(Phase::Disconnect);
        for obj in &mut self.objs {
            obj.disconnect(&mut self.env);
        }
        for pos in 0..self.env.proxies.len() {
            let reply = self.phase_reply(pos, Phase::Disconnect);
            self.env.proxies[pos].proxy.disconnect(None, reply);
        }
        self.drain_obj_events();
        self.check_phase(Phase::Disconnect);
    }

    fn check_phase(&mut self, phase: Phase) {
        if self.phase != Some(phase) || self.announced == Some(phase) {
            return;
        }
        if !self.proxy_phases.is_settled(phase) || !self.obj_phases.is_settled(phase) {
            return;
        }
        self.announced = Some(phase);

        if phase != Phase::Disconnect && self.obj_phases.all_errored() {
            self.record(EngineError::generic("No objtypes left without error. Aborting"));
            self.emit(EngineEvent::Error);
            self.enter_disconnect();
            return;
        }

        info!(phase = phase.verb(), "group completed phase");
        match phase {
            Phase::Connect => {
                self.emit(EngineEvent::Connected);
                self.enter_read();
            }
            Phase::Read => {
                let pending: usize = self.objs.iter().map(|obj| obj.conflicts().len()).sum();
                debug!(pending_conflicts = pending, "all changes read");
                self.emit(EngineEvent::Read);
                self.emit(EngineEvent::EndConflicts);
                self.enter_write();
            }
            Phase::Write => {
                self.emit(EngineEvent::Written);
                self.enter_sync_done();
            }
            Phase::SyncDone => {
                self.emit(EngineEvent::SyncDone);
                self.enter_disconnect();
            }
            Phase::Disconnect => self.end_session(),
        }
    }

    fn end_session(&mut self) {
        let mappings: usize = self.objs.iter().map(|obj| obj.mappings().len()).sum();
        if !self.obj_phases.all_errored() {
            self.emit(EngineEvent::Disconnected);
        }
        if self.error.is_none() {
            self.emit(EngineEvent::Successful);
        }
        self.objs.clear();
        self.proxy_phases.reset();
        self.obj_phases = PhaseTracker::new(0);
        self.phase = None;
        self.announced = None;
        self.env.slow_sync = false;

        let error = self.error.take();
        match &error {
            Some(error) => warn!(session = self.env.session, %error, "synchronization failed"),
            None => info!(session = self.env.session, mappings, "synchronization finished"),
        }
        self.shared.finish(error);
    }

    fn drain_obj_events(&mut self) {
        loop {
            let pending: Vec<(usize, ObjEvent)> = self
                .objs
                .iter_mut()
                .enumerate()
                .flat_map(|(index, obj)| {
                    obj.take_events().into_iter().map(move |event| (index, event))
                })
                .collect();
            if pending.is_empty() {
                break;
            }
            for (index, event) in pending {
                self.handle_obj_event(index, event);
            }
        }
    }

    fn handle_obj_event(&mut self, index: usize, event: ObjEvent) {
        let Some(phase) = self.phase else {
            return;
        };
        match event {
            ObjEvent::Done(done) => {
                self.obj_phases.mark_done(done, index);
                self.check_phase(done);
            }
            ObjEvent::Error => {
                self.obj_phases.mark_error(index);
                if let Some(error) = self.objs.get_mut(index).and_then(ObjEngine::take_error) {
                    self.record(error);
                }
                self.check_phase(phase);
            }
        }
    }

    fn handle_proxy(&mut self, event: ProxyEvent) {
        let ProxyEvent {
            session,
            member,
            scope,
            kind,
        } = event;

        match kind {
            ProxyEventKind::Discovered(result) => return self.discovered(member, result),
            ProxyEventKind::Finalized(result) => return self.finalized(member, result),
            _ => {}
        }
        if session != self.env.session || self.phase.is_none() {
            debug!(session, member, "dropping answer from a finished session");
            return;
        }

        match scope {
            Scope::ObjType(index) => {
                let Some(obj) = self.objs.get_mut(index) else {
                    return;
                };
                match kind {
                    ProxyEventKind::Finished { phase, result } => {
                        obj.handle_finished(&mut self.env, member, phase, result);
                    }
                    ProxyEventKind::Change(change) => obj.receive_change(&mut self.env, member, change),
                    ProxyEventKind::Committed { mapping, result } => {
                        obj.handle_committed(&mut self.env, member, mapping, result);
                    }
                    ProxyEventKind::Discovered(_) | ProxyEventKind::Finalized(_) => {}
                }
                self.drain_obj_events();
            }
            Scope::Group => match kind {
                ProxyEventKind::Finished { phase, result } => {
                    self.group_finished(member, phase, result);
                }
                ProxyEventKind::Change(change) => {
                    let target = self.objs.iter_mut().find(|obj| {
                        obj.objtype() == change.objtype
                            && obj.sinks().iter().any(|sink| sink.proxy() == member)
                    });
                    match target {
                        Some(obj) => obj.receive_change(&mut self.env, member, change),
                        None => debug!(objtype = %change.objtype, member, "no object type for change"),
                    }
                    self.drain_obj_events();
                }
                _ => debug!(member, "unexpected group answer"),
            },
        }
    }

    fn group_finished(&mut self, pos: usize, phase: Phase, result: EngineResult<()>) {
        let Some(member_id) = self.env.proxies.get(pos).map(|slot| slot.member_id) else {
            return;
        };
        match result {
            Ok(()) => {
                self.proxy_phases.mark_done(phase, pos);
                self.env.status.member(MemberUpdate {
                    event: MemberEvent::for_phase(phase),
                    member_id,
                    objtype: None,
                    error: None,
                });
            }
            Err(error) => {
                warn!(member_id, phase = phase.verb(), %error, "member failed");
                self.proxy_phases.mark_error(pos);
                self.env.status.member(MemberUpdate {
                    event: MemberEvent::Error,
                    member_id,
                    objtype: None,
                    error: Some(error.to_string()),
                });
            }
        }
        self.check_phase(phase);
    }

    fn resolve(&mut self, mapping: MappingRef, resolution: Resolution) {
        if self.phase.is_none() || mapping.session != self.env.session {
            warn!(?mapping, "resolution for a mapping of a finished session");
            return;
        }
        let writing = self.phase == Some(Phase::Write);
        let failed = self.obj_phases.is_error(mapping.objtype);
        let Some(obj) = self.objs.get_mut(mapping.objtype) else {
            return;
        };
        obj.resolve(&mut self.env, mapping.index, resolution);
        if writing && !failed {
            obj.write(&mut self.env);
        }
        self.drain_obj_events();
    }

    fn abort(&mut self) {
        match self.phase {
            None => debug!("nothing to abort"),
            Some(Phase::Disconnect) => debug!("already disconnecting"),
            Some(_) => {
                warn!(session = self.env.session, "aborting synchronization");
                self.record(EngineError::generic("Synchronization aborted"));
                self.emit(EngineEvent::Error);
                self.enter_disconnect();
            }
        }
    }

    fn discover(&mut self, member_id: MemberId) {
        let Some(pos) = self
            .env
            .proxies
            .iter()
            .position(|slot| slot.member_id == member_id)
        else {
            self.shared
                .set_discovered(Err(EngineError::generic("Unable to find member")));
            return;
        };
        let reply = DiscoverReply::new(self.env.tx.clone(), self.env.session, pos);
        self.env.proxies[pos].proxy.discover(reply);
    }

    fn discovered(&mut self, pos: usize, result: EngineResult<Vec<String>>) {
        let Some(member_id) = self.env.proxies.get(pos).map(|slot| slot.member_id) else {
            return;
        };
        let (event, error) = match &result {
            Ok(objtypes) => {
                info!(member_id, ?objtypes, "member discovered");
                (MemberEvent::Discovered, None)
            }
            Err(error) => (MemberEvent::Error, Some(error.to_string())),
        };
        self.env.status.member(MemberUpdate {
            event,
            member_id,
            objtype: None,
            error,
        });
        self.shared.set_discovered(result);
    }

    fn finalized(&mut self, pos: usize, result: EngineResult<()>) {
        let Some(slot) = self.env.proxies.get_mut(pos) else {
            return;
        };
        slot.finalized = true;
        if let Err(error) = result {
            let member_id = slot.member_id;
            warn!(member_id, %error, "member failed to finalize");
            self.env.status.member(MemberUpdate {
                event: MemberEvent::Error,
                member_id,
                objtype: None,
                error: Some(error.to_string()),
            });
        }
    }

    /// Processes queued messages until `done` holds or `deadline` passes.
    fn pump(
        &mut self,
        rx: &Receiver<Message>,
        deadline: Instant,
        done: impl Fn(&Self) -> bool,
    ) -> bool {
        while !done(self) {
            if Instant::now() >= deadline {
                return false;
            }
            match rx.recv_timeout(self.config.poll_interval) {
                Ok(Message::Proxy(event)) => self.handle_proxy(event),
                Ok(Message::Command(command)) => {
                    debug!(?command, "dropping command during finalize");
                }
                Ok(Message::Finalize) | Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return false,
            }
        }
        true
    }

    /// Disconnects a running session, then finalizes every member with a
    /// bounded wait each.
    fn finalize(&mut self, rx: &Receiver<Message>) {
        let timeout = self.config.finalize_timeout;

        if self.phase.is_some() {
            self.abort();
            let ended = self.pump(rx, Instant::now() + timeout, |core| core.phase.is_none());
            if !ended {
                warn!("session did not disconnect in time");
                self.record(EngineError::Timeout("waiting for members to disconnect".into()));
                self.objs.clear();
                self.phase = None;
                self.announced = None;
                self.shared.finish(self.error.take());
            }
        }

        for pos in 0..self.env.proxies.len() {
            let reply = FinalizeReply::new(self.env.tx.clone(), self.env.session, pos);
            self.env.proxies[pos].proxy.finalize(reply);

            let finished =
                self.pump(rx, Instant::now() + timeout, |core| core.env.proxies[pos].finalized);
            if !finished {
                let member_id = self.env.proxies[pos].member_id;
                warn!(member_id, "member did not finalize in time");
                self.env.status.member(MemberUpdate {
                    event: MemberEvent::Error,
                    member_id,
                    objtype: None,
                    error: Some("finalize timed out".into()),
                });
            }
        }
        debug!(group = %self.group.name, "engine finalized");
    }
}
