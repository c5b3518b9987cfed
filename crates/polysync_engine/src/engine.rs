//! The public engine handle.

use crate::command::{send, Command, MappingRef, Message};
use crate::config::EngineConfig;
use crate::driver::{synchronizable_objtypes, EngineCore, Shared};
use crate::error::{EngineError, EngineResult};
use crate::lock::{GroupLock, LockState};
use crate::proxy::MemberProxy;
use crate::status::{
    ChangeUpdate, EngineEvent, EngineUpdate, MappingConflict, MappingUpdate, MemberUpdate,
    StatusHub,
};
use polysync_archive::Archive;
use polysync_types::{FormatEnv, Group, MemberId, PlainFormat};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// Lifecycle of an [`Engine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Not initialized, or finalized.
    Uninitialized,
    /// The engine thread is running.
    Initialized,
}

#[derive(Debug)]
struct Runtime {
    tx: Sender<Message>,
    handle: JoinHandle<()>,
}

/// Synchronizes one group.
///
/// ```ignore
/// let mut engine = Engine::new(group, EngineConfig::default());
/// engine.set_conflict_callback(|conflict| {
///     let _ = conflict.resolver().duplicate();
/// });
/// engine.initialize(proxies)?;
/// engine.synchronize_and_block()?;
/// engine.finalize()?;
/// ```
pub struct Engine {
    group: Group,
    config: EngineConfig,
    formats: Arc<dyn FormatEnv>,
    status: StatusHub,
    shared: Arc<Shared>,
    runtime: Option<Runtime>,
    lock: Option<GroupLock>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("group", &self.group.name)
            .field("state", &self.state())
            .finish()
    }
}

impl Engine {
    /// Creates an engine for `group` comparing payloads byte-wise.
    pub fn new(group: Group, config: EngineConfig) -> Self {
        Self::with_formats(group, config, Arc::new(PlainFormat::new()))
    }

    /// Creates an engine with a custom format collaborator.
    pub fn with_formats(group: Group, config: EngineConfig, formats: Arc<dyn FormatEnv>) -> Self {
        Self {
            group,
            config,
            formats,
            status: StatusHub::default(),
            shared: Arc::new(Shared::default()),
            runtime: None,
            lock: None,
        }
    }

    /// The synchronized group.
    pub fn group(&self) -> &Group {
        &self.group
    }

    /// The configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Current lifecycle state.
    pub fn state(&self) -> EngineState {
        if self.runtime.is_some() {
            EngineState::Initialized
        } else {
            EngineState::Uninitialized
        }
    }

    /// Sets the callback receiving conflicted mappings.
    ///
    /// Without one, a conflicted mapping stays pending and the session
    /// waits in the write phase until [`Engine::abort`]. Callbacks may
    /// replace any callback, including themselves.
    pub fn set_conflict_callback(
        &self,
        callback: impl Fn(&MappingConflict) + Send + Sync + 'static,
    ) {
        self.status.set_conflict(Arc::new(callback));
    }

    /// Sets the callback receiving member status updates.
    pub fn set_member_status_callback(
        &self,
        callback: impl Fn(&MemberUpdate) + Send + Sync + 'static,
    ) {
        self.status.set_member(Arc::new(callback));
    }

    /// Sets the callback receiving change status updates.
    pub fn set_change_status_callback(
        &self,
        callback: impl Fn(&ChangeUpdate) + Send + Sync + 'static,
    ) {
        self.status.set_change(Arc::new(callback));
    }

    /// Sets the callback receiving mapping status updates.
    pub fn set_mapping_status_callback(
        &self,
        callback: impl Fn(&MappingUpdate) + Send + Sync + 'static,
    ) {
        self.status.set_mapping(Arc::new(callback));
    }

    /// Sets the callback receiving engine status updates.
    pub fn set_engine_status_callback(
        &self,
        callback: impl Fn(&EngineUpdate) + Send + Sync + 'static,
    ) {
        self.status.set_engine(Arc::new(callback));
    }

    /// Locks the group, opens the archive and starts the engine thread.
    ///
    /// `proxies` must match the group's members one to one, in order.
    ///
    /// # Errors
    ///
    /// Configuration errors leave the engine uninitialized and the group
    /// unlocked.
    pub fn initialize(&mut self, proxies: Vec<Box<dyn MemberProxy>>) -> EngineResult<()> {
        if self.runtime.is_some() {
            return Err(EngineError::AlreadyInitialized);
        }

        let count = self.group.members.len();
        if count < 2 {
            return Err(EngineError::Misconfiguration(format!(
                "You only configured {count} members, but at least 2 are needed"
            )));
        }
        let matching = proxies.len() == count
            && proxies
                .iter()
                .zip(&self.group.members)
                .all(|(proxy, member)| proxy.member_id() == member.id);
        if !matching {
            return Err(EngineError::Misconfiguration(
                "member proxies do not match the group members".into(),
            ));
        }
        if synchronizable_objtypes(&self.group).is_empty() {
            return Err(EngineError::Misconfiguration(
                "No synchronizable objtype".into(),
            ));
        }

        let mut slow_sync = false;
        let lock = match &self.group.config_dir {
            Some(dir) => {
                let (lock, state) = GroupLock::acquire(dir)?;
                if state == LockState::Stale {
                    warn!(group = %self.group.name, "previous synchronization was not finished cleanly");
                    slow_sync = self.config.slow_sync_on_unclean;
                    self.status.engine(EngineUpdate {
                        event: EngineEvent::PrevUnclean,
                        error: None,
                    });
                }
                Some(lock)
            }
            None => None,
        };

        let archive = match &self.group.config_dir {
            Some(dir) => Archive::open(&dir.join(&self.config.archive_file))?,
            None => Archive::open_in_memory()?,
        };

        let (tx, rx) = mpsc::channel();
        let core = EngineCore::new(
            self.group.clone(),
            self.config.clone(),
            proxies,
            archive,
            Arc::clone(&self.formats),
            self.status.clone(),
            Arc::clone(&self.shared),
            tx.clone(),
            slow_sync,
        );
        let handle = thread::Builder::new()
            .name(self.config.thread_name.clone())
            .spawn(move || core.run(rx))?;

        self.runtime = Some(Runtime { tx, handle });
        self.lock = lock;
        info!(group = %self.group.name, members = count, slow_sync, "engine initialized");
        Ok(())
    }

    /// Stops the engine thread and unlocks the group.
    ///
    /// A running session is aborted and disconnected first.
    pub fn finalize(&mut self) -> EngineResult<()> {
        let runtime = self.runtime.take().ok_or(EngineError::NotInitialized)?;
        if runtime.tx.send(Message::Finalize).is_err() {
            debug!("engine thread already stopped");
        }
        let joined = runtime.handle.join();
        self.lock = None;
        joined.map_err(|_| EngineError::generic("engine thread panicked"))?;
        info!(group = %self.group.name, "engine finalized");
        Ok(())
    }

    fn tx(&self) -> EngineResult<&Sender<Message>> {
        self.runtime
            .as_ref()
            .map(|runtime| &runtime.tx)
            .ok_or(EngineError::NotInitialized)
    }

    fn start(&self) -> EngineResult<u64> {
        let tx = self.tx()?;
        let since = self.shared.begin()?;
        if let Err(error) = send(tx, Command::Connect) {
            self.shared.finish(None);
            return Err(error);
        }
        Ok(since)
    }

    /// Starts a synchronization and returns immediately.
    ///
    /// # Errors
    ///
    /// `Busy` if a synchronization is running.
    pub fn synchronize(&self) -> EngineResult<()> {
        self.start().map(|_| ())
    }

    /// Runs a synchronization to its end.
    ///
    /// Returns the session's error; use [`EngineError::root_cause`] for the
    /// first failure. Conflicts need a conflict callback that resolves
    /// them; without one this blocks until another thread calls
    /// [`Engine::abort`].
    pub fn synchronize_and_block(&self) -> EngineResult<()> {
        let since = self.start()?;
        self.shared.wait(since)
    }

    /// Blocks until the running synchronization ended.
    pub fn wait_sync_end(&self) -> EngineResult<()> {
        self.tx()?;
        self.shared.wait_idle()
    }

    /// Aborts the running synchronization.
    pub fn abort(&self) -> EngineResult<()> {
        send(self.tx()?, Command::Abort)
    }

    /// Makes the entry of `member_id` the master of a conflicted mapping.
    pub fn mapping_solve(&self, mapping: MappingRef, member_id: MemberId) -> EngineResult<()> {
        send(self.tx()?, Command::Solve { mapping, member_id })
    }

    /// Splits a conflicted mapping into one mapping per distinct value.
    pub fn mapping_duplicate(&self, mapping: MappingRef) -> EngineResult<()> {
        send(self.tx()?, Command::Duplicate(mapping))
    }

    /// Leaves a conflicted mapping unsynchronized for this session.
    pub fn mapping_ignore(&self, mapping: MappingRef) -> EngineResult<()> {
        send(self.tx()?, Command::Ignore(mapping))
    }

    /// Resolves a conflicted mapping in favour of the newest entry.
    pub fn mapping_use_latest(&self, mapping: MappingRef) -> EngineResult<()> {
        send(self.tx()?, Command::UseLatest(mapping))
    }

    /// Asks a member which object types it supports.
    ///
    /// Fails with [`EngineError::Timeout`] when the member does not answer
    /// within [`EngineConfig::discover_timeout`].
    pub fn discover_and_block(&self, member_id: MemberId) -> EngineResult<Vec<String>> {
        let tx = self.tx()?;
        self.shared.reset_discovered();
        send(tx, Command::Discover(member_id))?;
        self.shared.wait_discovered(self.config.discover_timeout)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if self.runtime.is_some() {
            if let Err(error) = self.finalize() {
                warn!(%error, "finalize on drop failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use polysync_types::Member;

    fn group(members: usize) -> Group {
        let mut group = Group::new("test").with_objtype("contact");
        for id in 1..=members as i64 {
            group = group.with_member(Member::new(id, format!("m{id}")));
        }
        group
    }

    #[test]
    fn starts_uninitialized() {
        let engine = Engine::new(group(2), EngineConfig::default());
        assert_eq!(engine.state(), EngineState::Uninitialized);
        assert!(matches!(engine.synchronize(), Err(EngineError::NotInitialized)));
        assert!(matches!(engine.abort(), Err(EngineError::NotInitialized)));
    }

    #[test]
    fn one_member_is_not_enough() {
        let mut engine = Engine::new(group(1), EngineConfig::default());
        let err = engine.initialize(Vec::new()).unwrap_err();
        assert!(err.is_configuration());
        assert_eq!(
            err.to_string(),
            "misconfiguration: You only configured 1 members, but at least 2 are needed"
        );
        assert_eq!(engine.state(), EngineState::Uninitialized);
    }

    #[test]
    fn proxies_must_match_members() {
        let mut engine = Engine::new(group(2), EngineConfig::default());
        let err = engine.initialize(Vec::new()).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn finalize_requires_initialize() {
        let mut engine = Engine::new(group(2), EngineConfig::default());
        assert!(matches!(engine.finalize(), Err(EngineError::NotInitialized)));
    }
}
