//! Per-object-type phase driver.
//!
//! An `ObjEngine` fans every phase out to the sinks of its object type,
//! joins their completions in a [`PhaseTracker`] and raises one event per
//! phase to the engine core. It owns the mappings of its object type and
//! drives them through conflict detection, resolution and propagation.
//!
//! Phase predicate: a phase is complete once every sink finished it or
//! errored. Finishing with fewer sinks than connected is an error.

use crate::command::{MappingRef, Resolver};
use crate::driver::Env;
use crate::entry::MappingEntryEngine;
use crate::error::{EngineError, EngineResult};
use crate::mapping::{ConflictCheck, MappingEngine};
use crate::phase::{Phase, PhaseTracker};
use crate::proxy::{ChangesReply, CommitReply, PhaseReply, Scope};
use crate::sink::SinkEngine;
use crate::status::{
    ChangeEvent, ChangeUpdate, ConflictEntry, MappingConflict, MappingEvent, MappingUpdate,
    MemberEvent, MemberUpdate,
};
use polysync_archive::{ArchivedChange, IgnoredConflict};
use polysync_types::{
    Change, ChangeType, CompareResult, ConvertTarget, MappingEntry, MappingId, Member, MemberId,
};
use tracing::{debug, info, trace, warn};

/// Events an object type raises to the engine core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ObjEvent {
    /// Every sink completed the phase.
    Done(Phase),
    /// The object type failed; see `take_error`.
    Error,
}

/// A decision for one conflicted mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Resolution {
    Solve(MemberId),
    Duplicate,
    Ignore,
    UseLatest,
}

/// Drives one object type through a session.
#[derive(Debug)]
pub(crate) struct ObjEngine {
    index: usize,
    objtype: String,
    sinks: Vec<SinkEngine>,
    mappings: Vec<MappingEngine>,
    conflicts: Vec<usize>,
    ignored: Vec<IgnoredConflict>,
    tracker: PhaseTracker,
    phase: Option<Phase>,
    announced: Option<Phase>,
    written: bool,
    failed: bool,
    error: Option<EngineError>,
    events: Vec<ObjEvent>,
}

impl ObjEngine {
    /// Builds the engine for `objtype` from the group's members (in proxy
    /// order) and reloads its mappings from the archive.
    pub(crate) fn new(
        index: usize,
        objtype: &str,
        members: &[Member],
        archived: Vec<ArchivedChange>,
    ) -> Self {
        let sinks: Vec<SinkEngine> = members
            .iter()
            .enumerate()
            .filter(|(_, member)| member.supports(objtype))
            .map(|(proxy, member)| SinkEngine::new(proxy, member.id))
            .collect();

        let mut engine = Self {
            index,
            objtype: objtype.to_string(),
            tracker: PhaseTracker::new(sinks.len()),
            sinks,
            mappings: Vec::new(),
            conflicts: Vec::new(),
            ignored: Vec::new(),
            phase: None,
            announced: None,
            written: false,
            failed: false,
            error: None,
            events: Vec::new(),
        };
        engine.load_mappings(archived);
        engine
    }

    /// Groups archive rows (ordered by mapping id) into mappings.
    fn load_mappings(&mut self, rows: Vec<ArchivedChange>) {
        let members = self.member_ids();
        let mut current: Option<MappingEngine> = None;

        for row in rows {
            if current.as_ref().map(MappingEngine::id) != Some(row.mapping_id) {
                if let Some(done) = current.take() {
                    self.add_mapping(done);
                }
                let mut mapping = MappingEngine::empty(&self.objtype, &members);
                mapping.set_id(row.mapping_id);
                current = Some(mapping);
            }

            let Some(mapping) = current.as_mut() else {
                continue;
            };
            match mapping.position_of(row.member_id) {
                Some(pos) => {
                    if let Some(entry) = mapping.entry_mut(pos) {
                        *entry.entry_mut() = MappingEntry::stored(row.id, row.member_id, row.uid);
                    }
                }
                None => debug!(
                    objtype = %self.objtype,
                    member_id = row.member_id,
                    "archived entry of a member without a sink"
                ),
            }
        }
        if let Some(done) = current.take() {
            self.add_mapping(done);
        }
        debug!(objtype = %self.objtype, mappings = self.mappings.len(), "loaded mappings");
    }

    pub(crate) fn objtype(&self) -> &str {
        &self.objtype
    }

    pub(crate) fn sinks(&self) -> &[SinkEngine] {
        &self.sinks
    }

    pub(crate) fn mappings(&self) -> &[MappingEngine] {
        &self.mappings
    }

    /// Indices of mappings waiting for a decision.
    pub(crate) fn conflicts(&self) -> &[usize] {
        &self.conflicts
    }

    pub(crate) fn take_events(&mut self) -> Vec<ObjEvent> {
        std::mem::take(&mut self.events)
    }

    pub(crate) fn take_error(&mut self) -> Option<EngineError> {
        self.error.take()
    }

    fn member_ids(&self) -> Vec<MemberId> {
        self.sinks.iter().map(SinkEngine::member_id).collect()
    }

    fn sink_position(&self, proxy: usize) -> Option<usize> {
        self.sinks.iter().position(|sink| sink.proxy() == proxy)
    }

    fn add_mapping(&mut self, mapping: MappingEngine) -> usize {
        let index = self.mappings.len();
        for sink in &mut self.sinks {
            sink.register(index);
        }
        self.mappings.push(mapping);
        index
    }

    fn raise(&mut self, phase: Phase) {
        if self.failed || self.announced == Some(phase) {
            return;
        }
        self.announced = Some(phase);
        info!(objtype = %self.objtype, phase = phase.verb(), "object type completed phase");
        self.events.push(ObjEvent::Done(phase));
    }

    fn fail(&mut self, error: EngineError) {
        warn!(objtype = %self.objtype, %error, "object type failed");
        self.error = Some(error.stacked_on(self.error.take()));
        if !self.failed {
            self.failed = true;
            self.events.push(ObjEvent::Error);
        }
    }

    fn record_sink_error(&mut self, env: &Env, pos: usize, error: &EngineError) {
        let member_id = self.sinks[pos].member_id();
        self.tracker.mark_error(pos);
        env.status.member(MemberUpdate {
            event: MemberEvent::Error,
            member_id,
            objtype: Some(self.objtype.clone()),
            error: Some(error.to_string()),
        });
        let error = EngineError::member(member_id, error.to_string());
        self.error = Some(error.stacked_on(self.error.take()));
    }

    /// Connects every sink.
    pub(crate) fn connect(&mut self, env: &mut Env) {
        self.phase = Some(Phase::Connect);
        if self.sinks.len() < 2 {
            self.fail(EngineError::generic(format!(
                "Less than 2 sinks support object type {}",
                self.objtype
            )));
            return;
        }
        for pos in 0..self.sinks.len() {
            self.send_phase(env, pos, Phase::Connect);
        }
        self.check_phase(env, Phase::Connect);
    }

    /// Loads the ignored-conflict ledger and asks every sink for changes.
    pub(crate) fn read(&mut self, env: &mut Env) {
        self.phase = Some(Phase::Read);

        let ledger = env
            .archive
            .load_ignored_conflicts(&self.objtype)
            .and_then(|rows| {
                env.archive.flush_ignored_conflicts(&self.objtype)?;
                Ok(rows)
            });
        match ledger {
            Ok(rows) => self.ignored = rows,
            Err(error) => {
                self.fail(error.into());
                return;
            }
        }

        for pos in 0..self.sinks.len() {
            if self.tracker.is_error(pos) {
                continue;
            }
            let proxy = self.sinks[pos].proxy();
            let reply = ChangesReply::new(
                env.tx.clone(),
                env.session,
                proxy,
                Scope::ObjType(self.index),
            );
            env.proxies[proxy]
                .proxy
                .get_changes(Some(self.objtype.as_str()), env.slow_sync, reply);
        }
        self.check_phase(env, Phase::Read);
    }

    /// Propagates every mapping and commits the dirty entries.
    ///
    /// Does nothing while conflicts are pending; each resolution calls it
    /// again.
    pub(crate) fn write(&mut self, env: &mut Env) {
        self.phase = Some(Phase::Write);
        if !self.conflicts.is_empty() {
            info!(
                objtype = %self.objtype,
                pending = self.conflicts.len(),
                "write waits for conflict resolution"
            );
            return;
        }
        if self.written {
            return;
        }
        self.written = true;

        let failure = self
            .mappings
            .iter_mut()
            .find_map(|mapping| match mapping.multiply() {
                Ok(()) | Err(EngineError::NoMaster) => None,
                Err(error) => Some(error),
            });
        if let Some(error) = failure {
            self.fail(error);
            return;
        }

        for pos in 0..self.sinks.len() {
            if self.tracker.is_error(pos) {
                continue;
            }
            let indices = self.sinks[pos].entries().to_vec();
            for index in indices {
                if self.tracker.is_error(pos) {
                    break;
                }
                let Some(entry) = self.mappings[index].entry(pos) else {
                    continue;
                };
                let (dirty, has_change) = (entry.is_dirty(), entry.change().is_some());
                if dirty {
                    self.commit(env, index, pos);
                } else if has_change {
                    let record = entry.entry().clone();
                    if let Err(error) = self.persist(env, index, pos, record) {
                        self.fail(error);
                        return;
                    }
                }
            }
            self.send_phase(env, pos, Phase::Write);
        }
        self.check_phase(env, Phase::Write);
    }

    fn commit(&mut self, env: &mut Env, index: usize, pos: usize) {
        let member_id = self.sinks[pos].member_id();
        let proxy = self.sinks[pos].proxy();
        let Some(change) = self.mappings[index]
            .entry(pos)
            .and_then(MappingEntryEngine::change)
            .cloned()
        else {
            return;
        };

        let change = if env.convert {
            match env
                .formats
                .convert(&change, ConvertTarget::Member(member_id))
            {
                Ok(converted) => converted,
                Err(error) => {
                    let error = EngineError::from(error);
                    env.status.change(ChangeUpdate {
                        event: ChangeEvent::Error,
                        change,
                        member_id,
                        mapping_id: Some(self.mappings[index].id()),
                        error: Some(error.to_string()),
                    });
                    self.record_sink_error(env, pos, &error);
                    return;
                }
            }
        } else {
            change
        };

        trace!(
            objtype = %self.objtype,
            member_id,
            uid = ?change.uid,
            changetype = ?change.changetype,
            "committing change"
        );
        let reply = CommitReply::new(
            env.tx.clone(),
            env.session,
            proxy,
            Scope::ObjType(self.index),
            index,
        );
        env.proxies[proxy].proxy.commit_change(change, reply);
    }

    /// Tells every healthy sink that the sync completed.
    pub(crate) fn sync_done(&mut self, env: &mut Env) {
        self.phase = Some(Phase::SyncDone);
        for pos in 0..self.sinks.len() {
            if !self.tracker.is_error(pos) {
                self.send_phase(env, pos, Phase::SyncDone);
            }
        }
        self.check_phase(env, Phase::SyncDone);
    }

    /// Disconnects every sink, including failed ones.
    pub(crate) fn disconnect(&mut self, env: &mut Env) {
        self.phase = Some(Phase::Disconnect);
        for pos in 0..self.sinks.len() {
            self.send_phase(env, pos, Phase::Disconnect);
        }
        self.check_phase(env, Phase::Disconnect);
    }

    fn send_phase(&mut self, env: &mut Env, pos: usize, phase: Phase) {
        let proxy = self.sinks[pos].proxy();
        let reply = PhaseReply::new(
            env.tx.clone(),
            env.session,
            proxy,
            Scope::ObjType(self.index),
            phase,
        );
        let objtype = Some(self.objtype.as_str());
        let member = &mut env.proxies[proxy].proxy;
        match phase {
            Phase::Connect => member.connect(objtype, env.slow_sync, reply),
            Phase::Write => member.committed_all(objtype, reply),
            Phase::SyncDone => member.sync_done(objtype, reply),
            Phase::Disconnect => member.disconnect(objtype, reply),
            Phase::Read => reply.done(Err(EngineError::generic(
                "reading goes through get_changes",
            ))),
        }
    }

    /// Records a sink's completion of `phase`.
    pub(crate) fn handle_finished(
        &mut self,
        env: &mut Env,
        proxy: usize,
        phase: Phase,
        result: EngineResult<()>,
    ) {
        let Some(pos) = self.sink_position(proxy) else {
            return;
        };
        match result {
            Ok(()) => {
                self.tracker.mark_done(phase, pos);
                env.status.member(MemberUpdate {
                    event: MemberEvent::for_phase(phase),
                    member_id: self.sinks[pos].member_id(),
                    objtype: Some(self.objtype.clone()),
                    error: None,
                });
            }
            Err(error) => {
                warn!(
                    objtype = %self.objtype,
                    member_id = self.sinks[pos].member_id(),
                    phase = phase.verb(),
                    %error,
                    "sink failed"
                );
                self.record_sink_error(env, pos, &error);
            }
        }
        self.check_phase(env, phase);
    }

    fn check_phase(&mut self, env: &mut Env, phase: Phase) {
        if self.failed || self.phase != Some(phase) || self.announced == Some(phase) {
            return;
        }
        if !self.tracker.is_settled(phase) {
            return;
        }

        match phase {
            Phase::Connect => {
                if self.tracker.completed(Phase::Connect) < 2 {
                    self.fail(EngineError::generic("Less than 2 sink engines are connected"));
                    return;
                }
            }
            Phase::Write => {
                if !self.written || self.pending_writes() {
                    return;
                }
            }
            _ => {}
        }

        if phase != Phase::Connect && self.tracker.fell_short(phase) {
            self.fail(EngineError::generic(format!(
                "Less sink engines reported {} than connected",
                phase.verb()
            )));
            return;
        }

        if phase == Phase::Read {
            self.map_changes(env);
            self.check_conflicts(env);
        }
        self.raise(phase);
    }

    fn pending_writes(&self) -> bool {
        (0..self.sinks.len())
            .filter(|pos| !self.tracker.is_error(*pos))
            .any(|pos| {
                self.mappings
                    .iter()
                    .any(|m| m.entry(pos).is_some_and(MappingEntryEngine::is_dirty))
            })
    }

    /// Routes an incoming change to the entry recorded for its uid, or parks
    /// it until every sink finished reading.
    pub(crate) fn receive_change(&mut self, env: &mut Env, proxy: usize, change: Change) {
        let Some(pos) = self.sink_position(proxy) else {
            debug!(objtype = %self.objtype, proxy, "change from a member without a sink");
            return;
        };
        if self.phase != Some(Phase::Read) || self.announced == Some(Phase::Read) {
            debug!(objtype = %self.objtype, uid = ?change.uid, "dropping change outside the read phase");
            return;
        }
        let member_id = self.sinks[pos].member_id();

        let change = if env.convert {
            match env.formats.convert(&change, ConvertTarget::Internal) {
                Ok(converted) => converted,
                Err(error) => {
                    env.status.change(ChangeUpdate {
                        event: ChangeEvent::Error,
                        change,
                        member_id,
                        mapping_id: None,
                        error: Some(error.to_string()),
                    });
                    return;
                }
            }
        } else {
            change
        };

        let found = self.sinks[pos].entries().iter().copied().find(|index| {
            self.mappings[*index]
                .entry(pos)
                .is_some_and(|entry| entry.matches(&change))
        });

        let mapping_id = match found {
            Some(index) => {
                self.mappings[index].update_entry(pos, Some(change.clone()));
                Some(self.mappings[index].id())
            }
            None => {
                self.sinks[pos].park(change.clone());
                None
            }
        };
        trace!(objtype = %self.objtype, member_id, uid = ?change.uid, ?mapping_id, "received change");
        env.status.change(ChangeUpdate {
            event: ChangeEvent::Read,
            change,
            member_id,
            mapping_id,
            error: None,
        });
    }

    /// Assigns parked changes to mappings.
    ///
    /// A change joins the first mapping where its member's slot is empty and
    /// whose representative compares Same, or Similar (which marks the
    /// mapping conflicted). Otherwise it starts a new mapping.
    fn map_changes(&mut self, env: &Env) {
        let members = self.member_ids();
        for pos in 0..self.sinks.len() {
            for change in self.sinks[pos].take_unmapped() {
                if change.changetype == ChangeType::Deleted {
                    debug!(objtype = %self.objtype, uid = ?change.uid, "deleted item was never mapped");
                    continue;
                }

                let target = self.mappings.iter().enumerate().find_map(|(index, mapping)| {
                    let free = mapping
                        .entry(pos)
                        .is_some_and(|e| e.change().is_none() && e.entry().uid.is_none());
                    if !free {
                        return None;
                    }
                    match env.formats.compare(&change, mapping.representative()?) {
                        CompareResult::Same => Some((index, false)),
                        CompareResult::Similar => Some((index, true)),
                        CompareResult::Mismatch => None,
                    }
                });

                let (index, similar) = match target {
                    Some(found) => found,
                    None => {
                        let mapping = MappingEngine::empty(&self.objtype, &members);
                        (self.add_mapping(mapping), false)
                    }
                };
                self.mappings[index].update_entry(pos, Some(change));
                if similar {
                    self.mappings[index].set_conflict(true);
                }
            }
        }
    }

    fn check_conflicts(&mut self, env: &mut Env) {
        for index in 0..self.mappings.len() {
            let mapping = &self.mappings[index];
            if mapping.is_synced() && !mapping.is_conflict() {
                continue;
            }
            match self.mappings[index].check_conflict(&*env.formats) {
                ConflictCheck::Conflict => self.report_conflict(env, index),
                ConflictCheck::Solved { synced: false } => {
                    let mapping = &self.mappings[index];
                    env.status.mapping(MappingUpdate {
                        event: MappingEvent::Solved,
                        winner: mapping.master_entry().map(MappingEntryEngine::member_id),
                        mapping_id: mapping.id(),
                        error: None,
                    });
                }
                ConflictCheck::Solved { synced: true }
                | ConflictCheck::Mastered
                | ConflictCheck::Empty => {}
            }
        }
    }

    fn report_conflict(&mut self, env: &mut Env, index: usize) {
        if self.replays_ignored(index) {
            match self.record_ignored(env, index) {
                Ok(()) => {
                    info!(
                        objtype = %self.objtype,
                        mapping_id = self.mappings[index].id(),
                        "conflict ignored again"
                    );
                    self.mappings[index].mark_ignored();
                    return;
                }
                Err(error) => warn!(%error, "could not renew ignored conflict"),
            }
        }

        if !self.conflicts.contains(&index) {
            self.conflicts.push(index);
        }
        let mapping = &self.mappings[index];
        let entries = mapping
            .entries()
            .iter()
            .map(|entry| ConflictEntry {
                member_id: entry.member_id(),
                change: entry.change().cloned(),
            })
            .collect();
        let handle = MappingRef {
            session: env.session,
            objtype: self.index,
            index,
        };
        let conflict = MappingConflict::new(
            self.objtype.clone(),
            mapping.id(),
            entries,
            self.supports_ignore(env),
            mapping.supports_use_latest(&*env.formats),
            Resolver::new(env.tx.clone(), handle),
        );
        info!(objtype = %self.objtype, mapping_id = mapping.id(), "reporting conflict");
        env.status.conflict(conflict);
    }

    /// True if the ledger holds this mapping with the same changetypes.
    fn replays_ignored(&self, index: usize) -> bool {
        let mapping = &self.mappings[index];
        if mapping.id() == 0 {
            return false;
        }
        let mut recorded: Vec<i64> = self
            .ignored
            .iter()
            .filter(|row| row.mapping_id == mapping.id())
            .map(|row| row.changetype.to_code())
            .collect();
        if recorded.is_empty() {
            return false;
        }
        let mut current: Vec<i64> = mapping
            .entries()
            .iter()
            .filter_map(MappingEntryEngine::change)
            .map(|change| change.changetype.to_code())
            .collect();
        recorded.sort_unstable();
        current.sort_unstable();
        recorded == current
    }

    /// Saves the mapping's changetypes to the ignored-conflict ledger. A
    /// mapping that was never saved gets its entries archived first so the
    /// ledger rows have a mapping id to point at.
    fn record_ignored(&mut self, env: &mut Env, index: usize) -> EngineResult<()> {
        if self.mappings[index].id() == 0 {
            for pos in 0..self.mappings[index].entries().len() {
                let Some(record) = self.mappings[index]
                    .entry(pos)
                    .map(|entry| entry.entry().clone())
                else {
                    continue;
                };
                self.persist(env, index, pos, record)?;
            }
        }
        let mapping = &self.mappings[index];
        if mapping.id() == 0 {
            debug!(objtype = %self.objtype, "ignored mapping has no entry to archive");
            return Ok(());
        }
        for change in mapping.entries().iter().filter_map(MappingEntryEngine::change) {
            env.archive
                .save_ignored_conflict(&self.objtype, mapping.id(), change.changetype)?;
        }
        Ok(())
    }

    fn supports_ignore(&self, env: &Env) -> bool {
        self.sinks
            .iter()
            .all(|sink| env.proxies[sink.proxy()].proxy.can_read(&self.objtype))
    }

    /// Applies a decision to a conflicted mapping.
    ///
    /// Failures are reported as `MappingEvent::Error` and leave the mapping
    /// conflicted.
    pub(crate) fn resolve(&mut self, env: &mut Env, index: usize, resolution: Resolution) {
        let Some(mapping) = self.mappings.get(index) else {
            warn!(objtype = %self.objtype, index, "resolution for an unknown mapping");
            return;
        };
        let mapping_id = mapping.id();

        let result = if mapping.is_conflict() {
            self.apply_resolution(env, index, resolution)
        } else {
            Err(EngineError::generic("mapping is not in conflict"))
        };

        match result {
            Ok(winner) => {
                info!(objtype = %self.objtype, mapping_id, ?resolution, "conflict resolved");
                self.conflicts.retain(|c| *c != index);
                env.status.mapping(MappingUpdate {
                    event: MappingEvent::Solved,
                    winner,
                    mapping_id,
                    error: None,
                });
            }
            Err(error) => {
                warn!(objtype = %self.objtype, mapping_id, ?resolution, %error, "resolution failed");
                env.status.mapping(MappingUpdate {
                    event: MappingEvent::Error,
                    winner: None,
                    mapping_id,
                    error: Some(error.to_string()),
                });
            }
        }
    }

    fn apply_resolution(
        &mut self,
        env: &mut Env,
        index: usize,
        resolution: Resolution,
    ) -> EngineResult<Option<MemberId>> {
        match resolution {
            Resolution::Solve(member_id) => {
                let mapping = &mut self.mappings[index];
                let pos = mapping.position_of(member_id).ok_or_else(|| {
                    EngineError::generic(format!("member {member_id} has no entry in this mapping"))
                })?;
                mapping.solve(pos)?;
                Ok(Some(member_id))
            }
            Resolution::UseLatest => {
                let mapping = &mut self.mappings[index];
                let pos = mapping.use_latest(&*env.formats)?;
                Ok(mapping.entry(pos).map(MappingEntryEngine::member_id))
            }
            Resolution::Ignore => {
                if !self.supports_ignore(env) {
                    return Err(EngineError::generic(
                        "ignoring requires every member to read single items",
                    ));
                }
                self.record_ignored(env, index)?;
                self.mappings[index].mark_ignored();
                Ok(None)
            }
            Resolution::Duplicate => self.duplicate(env, index),
        }
    }

    fn duplicate(&mut self, env: &Env, index: usize) -> EngineResult<Option<MemberId>> {
        let plan = self.mappings[index].plan_duplicate(&*env.formats)?;
        let members = self.member_ids();

        let mut created = Vec::with_capacity(plan.new_mappings);
        for _ in 0..plan.new_mappings {
            let mapping = MappingEngine::empty(&self.objtype, &members);
            created.push(self.add_mapping(mapping));
        }

        for pos in &plan.dropped {
            self.mappings[index].update_entry(*pos, None);
        }

        for placement in plan.placements {
            let target = match placement.slot {
                0 => index,
                slot => created[slot - 1],
            };
            let mapping = &mut self.mappings[target];
            mapping.update_entry(placement.pos, Some(placement.change));
            if let Some(entry) = mapping.entry_mut(placement.pos) {
                entry.set_dirty(placement.dirty);
            }
            mapping.solve(placement.pos)?;
        }

        debug!(
            objtype = %self.objtype,
            mapping_id = self.mappings[index].id(),
            created = created.len(),
            "duplicated mapping"
        );
        Ok(self.mappings[index]
            .master_entry()
            .map(MappingEntryEngine::member_id))
    }

    /// Handles a commit completion.
    pub(crate) fn handle_committed(
        &mut self,
        env: &mut Env,
        proxy: usize,
        index: usize,
        result: EngineResult<Option<String>>,
    ) {
        let Some(pos) = self.sink_position(proxy) else {
            return;
        };
        let member_id = self.sinks[pos].member_id();
        let Some(entry) = self.mappings.get(index).and_then(|m| m.entry(pos)) else {
            return;
        };
        let Some(change) = entry.change().cloned() else {
            return;
        };

        match result {
            Ok(assigned) => {
                let mut record = entry.entry().clone();
                if let Some(uid) = assigned {
                    record.uid = Some(uid);
                } else if record.uid.is_none() {
                    record.uid.clone_from(&change.uid);
                }

                if let Err(error) = self.persist(env, index, pos, record) {
                    self.fail(error);
                    return;
                }
                let mapping = &mut self.mappings[index];
                if let Some(entry) = mapping.entry_mut(pos) {
                    entry.set_dirty(false);
                }
                env.status.change(ChangeUpdate {
                    event: ChangeEvent::Written,
                    change,
                    member_id,
                    mapping_id: Some(mapping.id()),
                    error: None,
                });
                mapping.update_entry(pos, None);
            }
            Err(error) => {
                warn!(objtype = %self.objtype, member_id, %error, "commit failed");
                env.status.change(ChangeUpdate {
                    event: ChangeEvent::Error,
                    change,
                    member_id,
                    mapping_id: Some(self.mappings[index].id()),
                    error: Some(error.to_string()),
                });
                self.record_sink_error(env, pos, &error);
            }
        }
        self.check_phase(env, Phase::Write);
    }

    /// Writes `record`, the entry's new identity, to the archive and then
    /// installs it in memory. Nothing in memory changes if the archive
    /// refuses the write.
    fn persist(
        &mut self,
        env: &mut Env,
        index: usize,
        pos: usize,
        record: MappingEntry,
    ) -> EngineResult<()> {
        let mapping = &mut self.mappings[index];
        let mapping_id: MappingId = mapping.id();
        let Some(change) = mapping.entry(pos).and_then(MappingEntryEngine::change) else {
            return Ok(());
        };
        let changetype = change.changetype;
        let change_uid = change.uid.clone();

        let stored = match changetype {
            ChangeType::Unknown => record,
            ChangeType::Deleted => {
                if record.id != 0 {
                    env.archive.delete_change(&self.objtype, record.id)?;
                }
                MappingEntry::new(record.member_id)
            }
            ChangeType::Added | ChangeType::Modified => {
                match record.uid.clone().or(change_uid) {
                    Some(uid) => {
                        let id = env.archive.save_change(
                            &self.objtype,
                            record.id,
                            &uid,
                            mapping_id,
                            record.member_id,
                        )?;
                        if mapping_id == 0 {
                            mapping.set_id(id);
                        }
                        MappingEntry::stored(id, record.member_id, uid)
                    }
                    None => record,
                }
            }
        };
        if let Some(entry) = mapping.entry_mut(pos) {
            *entry.entry_mut() = stored;
        }
        Ok(())
    }
}
