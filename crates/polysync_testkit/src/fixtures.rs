//! Group fixtures and status recorders.
//!
//! A [`TestGroup`] owns a group description and one [`MockHandle`] per
//! member. On-disk groups keep their temporary directory alive, so the
//! archive and lock survive across engines built from the same fixture.

use crate::mock::{MockHandle, MockMember, MOCK_FORMAT};
use parking_lot::Mutex;
use polysync_engine::{
    ChangeUpdate, Engine, EngineConfig, EngineEvent, EngineUpdate, MappingEvent, MappingUpdate,
    MemberEvent, MemberProxy, MemberUpdate,
};
use polysync_types::{Change, ChangeType, Group, Member, MemberId};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

/// Builds a change carrying a plain payload.
pub fn plain_change(uid: &str, objtype: &str, changetype: ChangeType, data: &str) -> Change {
    let change = Change::new(uid, objtype, changetype);
    if changetype == ChangeType::Deleted {
        change
    } else {
        change.with_data(MOCK_FORMAT, data)
    }
}

/// A sync group made of mock members.
#[derive(Debug)]
pub struct TestGroup {
    /// Group description handed to engines.
    pub group: Group,
    /// Engine configuration handed to engines.
    pub config: EngineConfig,
    handles: Vec<MockHandle>,
    _temp_dir: Option<TempDir>,
}

impl TestGroup {
    /// Creates a group of `members` mocks without configuration directory.
    pub fn in_memory(members: usize, objtypes: &[&str]) -> Self {
        Self::build(members, objtypes, None)
    }

    /// Creates a group of `members` mocks in a temporary directory.
    pub fn on_disk(members: usize, objtypes: &[&str]) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        Self::build(members, objtypes, Some(temp_dir))
    }

    fn build(members: usize, objtypes: &[&str], temp_dir: Option<TempDir>) -> Self {
        let mut group = Group::new("test");
        if let Some(dir) = &temp_dir {
            group = group.with_config_dir(dir.path());
        }
        for objtype in objtypes {
            group = group.with_objtype(*objtype);
        }
        let mut handles = Vec::with_capacity(members);
        for index in 0..members {
            let id = index as MemberId + 1;
            let name = member_name(index);
            group = group.with_member(Member::new(id, name.clone()));
            let (_, handle) = MockMember::new(id, name);
            handles.push(handle);
        }
        Self {
            group,
            config: EngineConfig::default(),
            handles,
            _temp_dir: temp_dir,
        }
    }

    /// Replaces the engine configuration.
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Restricts member `index` to `objtypes`.
    pub fn restrict_member(mut self, index: usize, objtypes: &[&str]) -> Self {
        let member = &mut self.group.members[index];
        member.objtypes = objtypes.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Handle of member `index` (0-based).
    pub fn member(&self, index: usize) -> &MockHandle {
        &self.handles[index]
    }

    /// All member handles.
    pub fn members(&self) -> &[MockHandle] {
        &self.handles
    }

    /// Configuration directory, if on disk.
    pub fn config_dir(&self) -> Option<&Path> {
        self._temp_dir.as_ref().map(TempDir::path)
    }

    /// Fresh proxies for every member, in group order.
    pub fn proxies(&self) -> Vec<Box<dyn MemberProxy>> {
        self.handles
            .iter()
            .map(|handle| Box::new(handle.proxy()) as Box<dyn MemberProxy>)
            .collect()
    }

    /// An uninitialized engine for this group.
    pub fn engine(&self) -> Engine {
        Engine::new(self.group.clone(), self.config.clone())
    }

    /// An initialized engine for this group.
    pub fn initialized_engine(&self) -> Engine {
        let mut engine = self.engine();
        engine
            .initialize(self.proxies())
            .expect("Failed to initialize engine");
        engine
    }
}

fn member_name(index: usize) -> String {
    let letter = (b'a' + (index % 26) as u8) as char;
    if index < 26 {
        letter.to_string()
    } else {
        format!("{letter}{}", index / 26)
    }
}

/// Records every status update of an engine.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    engine: Arc<Mutex<Vec<EngineUpdate>>>,
    member: Arc<Mutex<Vec<MemberUpdate>>>,
    change: Arc<Mutex<Vec<ChangeUpdate>>>,
    mapping: Arc<Mutex<Vec<MappingUpdate>>>,
}

impl EventLog {
    /// Installs recording status callbacks on `engine`.
    ///
    /// The conflict callback is left to the test.
    pub fn attach(engine: &Engine) -> Self {
        let log = Self::default();
        let sink = Arc::clone(&log.engine);
        engine.set_engine_status_callback(move |update| sink.lock().push(update.clone()));
        let sink = Arc::clone(&log.member);
        engine.set_member_status_callback(move |update| sink.lock().push(update.clone()));
        let sink = Arc::clone(&log.change);
        engine.set_change_status_callback(move |update| sink.lock().push(update.clone()));
        let sink = Arc::clone(&log.mapping);
        engine.set_mapping_status_callback(move |update| sink.lock().push(update.clone()));
        log
    }

    /// Engine events, in order.
    pub fn engine_events(&self) -> Vec<EngineEvent> {
        self.engine.lock().iter().map(|u| u.event).collect()
    }

    /// Engine updates, in order.
    pub fn engine_updates(&self) -> Vec<EngineUpdate> {
        self.engine.lock().clone()
    }

    /// Member updates, in order.
    pub fn member_updates(&self) -> Vec<MemberUpdate> {
        self.member.lock().clone()
    }

    /// Members that reported `event`.
    pub fn members_with(&self, event: MemberEvent) -> Vec<MemberId> {
        self.member
            .lock()
            .iter()
            .filter(|u| u.event == event)
            .map(|u| u.member_id)
            .collect()
    }

    /// Change updates, in order.
    pub fn change_updates(&self) -> Vec<ChangeUpdate> {
        self.change.lock().clone()
    }

    /// Mapping updates, in order.
    pub fn mapping_updates(&self) -> Vec<MappingUpdate> {
        self.mapping.lock().clone()
    }

    /// Number of mapping updates carrying `event`.
    pub fn mapping_count(&self, event: MappingEvent) -> usize {
        self.mapping.lock().iter().filter(|u| u.event == event).count()
    }

    /// Forgets everything recorded so far.
    pub fn clear(&self) {
        self.engine.lock().clear();
        self.member.lock().clear();
        self.change.lock().clear();
        self.mapping.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn members_get_letters() {
        let group = TestGroup::in_memory(3, &["contact"]);
        let names: Vec<&str> = group.group.members.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert_eq!(group.member(2).id(), 3);
        assert!(group.config_dir().is_none());
    }

    #[test]
    fn on_disk_group_has_config_dir() {
        let group = TestGroup::on_disk(2, &["contact"]);
        let dir = group.config_dir().unwrap();
        assert_eq!(group.group.config_dir.as_deref(), Some(dir));
    }

    #[test]
    fn deleted_changes_carry_no_payload() {
        let change = plain_change("x", "contact", ChangeType::Deleted, "ignored");
        assert!(!change.has_data());
    }
}
