//! End-to-end sessions against mock members.

use polysync_engine::{
    ConflictCheck, EngineConfig, EngineError, EngineEvent, EngineState, EngineUpdate,
    MappingConflict, MappingEvent, MappingEngine, MemberEvent,
};
use polysync_testkit::prelude::*;
use polysync_types::{ChangeType, PlainFormat};
use proptest::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

const CONTACT: &str = "contact";

/// Syncs one item from the first member so every member holds it.
fn baseline(group: &TestGroup, engine: &polysync_engine::Engine) {
    group.member(0).add(CONTACT, "a1", "hello");
    engine.synchronize_and_block().unwrap();
}

fn member_uid(group: &TestGroup, index: usize) -> String {
    group.member(index).items(CONTACT)[0].uid.clone().unwrap()
}

#[test]
fn addition_reaches_every_member() {
    init_tracing();
    let group = TestGroup::in_memory(3, &[CONTACT]);
    let engine = group.initialized_engine();
    let log = EventLog::attach(&engine);
    assert_eq!(engine.state(), EngineState::Initialized);

    group.member(0).add(CONTACT, "a1", "hello");
    engine.synchronize_and_block().unwrap();

    for index in 1..3 {
        assert_eq!(group.member(index).payloads(CONTACT), vec!["hello".to_string()]);
        let commits = group.member(index).commits();
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].changetype, ChangeType::Added);
    }
    assert!(group.member(0).commits().is_empty());
    assert_eq!(
        log.engine_events(),
        vec![
            EngineEvent::Connected,
            EngineEvent::Read,
            EngineEvent::EndConflicts,
            EngineEvent::Written,
            EngineEvent::SyncDone,
            EngineEvent::Disconnected,
            EngineEvent::Successful,
        ]
    );
    assert_eq!(log.mapping_count(MappingEvent::Solved), 1);
}

#[test]
fn quiet_session_writes_nothing() {
    let group = TestGroup::in_memory(2, &[CONTACT]);
    let engine = group.initialized_engine();
    baseline(&group, &engine);

    engine.synchronize_and_block().unwrap();
    assert_eq!(group.member(1).commits().len(), 1);
}

#[test]
fn modification_and_deletion_follow_the_mapping() {
    let group = TestGroup::in_memory(2, &[CONTACT]);
    let engine = group.initialized_engine();
    baseline(&group, &engine);
    let uid = member_uid(&group, 1);

    group.member(0).modify(CONTACT, "a1", "world");
    engine.synchronize_and_block().unwrap();
    assert_eq!(group.member(1).data(CONTACT, &uid), Some(b"world".to_vec()));
    assert_eq!(group.member(1).items(CONTACT).len(), 1);

    group.member(0).delete(CONTACT, "a1");
    engine.synchronize_and_block().unwrap();
    assert!(group.member(1).items(CONTACT).is_empty());
    let last = group.member(1).commits().pop().unwrap();
    assert_eq!(last.changetype, ChangeType::Deleted);
    assert_eq!(last.uid.as_deref(), Some(uid.as_str()));
}

#[test]
fn equal_additions_are_matched_without_writes() {
    let group = TestGroup::in_memory(2, &[CONTACT]);
    let engine = group.initialized_engine();
    group.member(0).add(CONTACT, "a1", "same");
    group.member(1).add(CONTACT, "b1", "same");

    engine.synchronize_and_block().unwrap();
    assert!(group.member(0).commits().is_empty());
    assert!(group.member(1).commits().is_empty());
}

#[test]
fn conflict_is_solved_by_the_chosen_member() {
    let group = TestGroup::in_memory(2, &[CONTACT]);
    let engine = group.initialized_engine();
    let reported = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&reported);
    engine.set_conflict_callback(move |conflict: &MappingConflict| {
        seen.fetch_add(1, Ordering::SeqCst);
        assert_eq!(conflict.objtype, CONTACT);
        assert_eq!(conflict.entries.len(), 2);
        assert!(conflict.mapping_id > 0);
        assert!(conflict.supports_ignore);
        conflict.resolver().solve(1).unwrap();
    });
    baseline(&group, &engine);
    let uid = member_uid(&group, 1);

    group.member(0).modify(CONTACT, "a1", "x");
    group.member(1).modify(CONTACT, &uid, "y");
    engine.synchronize_and_block().unwrap();

    assert_eq!(reported.load(Ordering::SeqCst), 1);
    assert_eq!(group.member(0).payloads(CONTACT), vec!["x".to_string()]);
    assert_eq!(group.member(1).payloads(CONTACT), vec!["x".to_string()]);
    let last = group.member(1).commits().pop().unwrap();
    assert_eq!(last.changetype, ChangeType::Modified);
}

#[test]
fn duplicate_splits_three_way_conflict() {
    let group = TestGroup::in_memory(3, &[CONTACT]);
    let engine = group.initialized_engine();
    let log = EventLog::attach(&engine);
    engine.set_conflict_callback(|conflict: &MappingConflict| {
        conflict.resolver().duplicate().unwrap();
    });
    baseline(&group, &engine);
    let b_uid = member_uid(&group, 1);
    let c_uid = member_uid(&group, 2);

    group.member(0).modify(CONTACT, "a1", "x");
    group.member(1).modify(CONTACT, &b_uid, "y");
    group.member(2).modify(CONTACT, &c_uid, "z");
    engine.synchronize_and_block().unwrap();

    let all = vec!["x".to_string(), "y".to_string(), "z".to_string()];
    for index in 0..3 {
        assert_eq!(group.member(index).payloads(CONTACT), all);
    }
    let elevated = format!("{c_uid}-dupe-dupe");
    assert!(group
        .member(0)
        .items(CONTACT)
        .iter()
        .any(|item| item.uid.as_deref() == Some(elevated.as_str())));
    assert_eq!(log.mapping_count(MappingEvent::Error), 0);

    engine.synchronize_and_block().unwrap();
    for index in 0..3 {
        assert_eq!(group.member(index).payloads(CONTACT), all);
    }
}

#[test]
fn use_latest_picks_the_newest_revision() {
    let group = TestGroup::in_memory(2, &[CONTACT]);
    let engine = group.initialized_engine();
    engine.set_conflict_callback(|conflict: &MappingConflict| {
        assert!(conflict.supports_use_latest);
        conflict.resolver().use_latest().unwrap();
    });
    baseline(&group, &engine);
    let uid = member_uid(&group, 1);

    group.member(0).modify_at(CONTACT, "a1", "older", 3);
    group.member(1).modify_at(CONTACT, &uid, "newer", 7);
    engine.synchronize_and_block().unwrap();

    assert_eq!(group.member(0).payloads(CONTACT), vec!["newer".to_string()]);
}

#[test]
fn use_latest_tie_leaves_the_conflict_open() {
    let group = TestGroup::in_memory(2, &[CONTACT]);
    let engine = group.initialized_engine();
    let log = EventLog::attach(&engine);
    engine.set_conflict_callback(|conflict: &MappingConflict| {
        assert!(!conflict.supports_use_latest);
        conflict.resolver().use_latest().unwrap();
        conflict.resolver().solve(2).unwrap();
    });
    baseline(&group, &engine);
    let uid = member_uid(&group, 1);

    group.member(0).modify_at(CONTACT, "a1", "left", 5);
    group.member(1).modify_at(CONTACT, &uid, "right", 5);
    engine.synchronize_and_block().unwrap();

    let errors: Vec<_> = log
        .mapping_updates()
        .into_iter()
        .filter(|u| u.event == MappingEvent::Error)
        .collect();
    assert_eq!(errors.len(), 1);
    assert_eq!(
        errors[0].error.as_deref(),
        Some(EngineError::RevisionTie.to_string().as_str())
    );
    assert_eq!(group.member(0).payloads(CONTACT), vec!["right".to_string()]);
}

#[test]
fn ignored_conflict_is_replayed_next_session() {
    let group = TestGroup::on_disk(2, &[CONTACT]);
    let engine = group.initialized_engine();
    let reported = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&reported);
    engine.set_conflict_callback(move |conflict: &MappingConflict| {
        seen.fetch_add(1, Ordering::SeqCst);
        conflict.resolver().ignore().unwrap();
    });
    baseline(&group, &engine);
    let uid = member_uid(&group, 1);

    group.member(0).modify(CONTACT, "a1", "x");
    group.member(1).modify(CONTACT, &uid, "y");
    engine.synchronize_and_block().unwrap();
    assert_eq!(reported.load(Ordering::SeqCst), 1);
    assert_eq!(group.member(0).payloads(CONTACT), vec!["x".to_string()]);
    assert_eq!(group.member(1).payloads(CONTACT), vec!["y".to_string()]);

    group.member(0).modify(CONTACT, "a1", "x2");
    group.member(1).modify(CONTACT, &uid, "y2");
    engine.synchronize_and_block().unwrap();
    assert_eq!(reported.load(Ordering::SeqCst), 1);
    assert_eq!(group.member(1).payloads(CONTACT), vec!["y2".to_string()]);
}

#[test]
fn ignore_needs_readable_members() {
    let group = TestGroup::in_memory(2, &[CONTACT]);
    let engine = group.initialized_engine();
    let log = EventLog::attach(&engine);
    engine.set_conflict_callback(|conflict: &MappingConflict| {
        assert!(!conflict.supports_ignore);
        conflict.resolver().ignore().unwrap();
        conflict.resolver().solve(1).unwrap();
    });
    baseline(&group, &engine);
    let uid = member_uid(&group, 1);
    group.member(1).set_readable(false);

    group.member(0).modify(CONTACT, "a1", "x");
    group.member(1).modify(CONTACT, &uid, "y");
    engine.synchronize_and_block().unwrap();

    assert_eq!(log.mapping_count(MappingEvent::Error), 1);
    assert_eq!(group.member(1).payloads(CONTACT), vec!["x".to_string()]);
}

#[test]
fn mappings_survive_engine_restarts() {
    let group = TestGroup::on_disk(2, &[CONTACT]);
    {
        let mut engine = group.initialized_engine();
        baseline(&group, &engine);
        engine.finalize().unwrap();
    }
    let dir = group.config_dir().unwrap().to_path_buf();
    assert!(dir.join(&group.config.archive_file).exists());
    assert!(!dir.join("lock").exists());

    let mut engine = group.engine();
    let log = EventLog::attach(&engine);
    engine.initialize(group.proxies()).unwrap();
    group.member(0).modify(CONTACT, "a1", "world");
    engine.synchronize_and_block().unwrap();
    engine.finalize().unwrap();

    assert_eq!(group.member(1).items(CONTACT).len(), 1);
    assert_eq!(group.member(1).payloads(CONTACT), vec!["world".to_string()]);
    assert!(!log.engine_events().contains(&EngineEvent::PrevUnclean));
}

#[test]
fn member_failing_to_connect_is_skipped() {
    let group = TestGroup::in_memory(3, &[CONTACT]);
    group.member(2).fail_on(MockOp::Connect, None);
    let engine = group.initialized_engine();
    let log = EventLog::attach(&engine);

    group.member(0).add(CONTACT, "a1", "hello");
    engine.synchronize_and_block().unwrap();

    assert_eq!(group.member(1).payloads(CONTACT), vec!["hello".to_string()]);
    assert!(group.member(2).commits().is_empty());
    assert_eq!(group.member(2).count(MockOp::GetChanges), 0);
    assert_eq!(group.member(2).count(MockOp::Disconnect), 2);
    assert!(log.members_with(MemberEvent::Error).contains(&3));
    assert!(log.engine_events().contains(&EngineEvent::Successful));
}

#[test]
fn read_failure_with_two_members_fails_the_session() {
    let group = TestGroup::in_memory(2, &[CONTACT]);
    group.member(1).fail_on(MockOp::GetChanges, Some(CONTACT));
    let engine = group.initialized_engine();
    let log = EventLog::attach(&engine);

    group.member(0).add(CONTACT, "a1", "hello");
    let err = engine.synchronize_and_block().unwrap_err();

    assert_eq!(
        err.to_string(),
        "No objtypes left without error. Aborting"
    );
    let events = log.engine_events();
    assert!(events.contains(&EngineEvent::Error));
    assert!(!events.contains(&EngineEvent::Successful));
    assert!(group.member(1).commits().is_empty());

    group.member(1).clear_failures();
    group.member(0).add(CONTACT, "a2", "again");
    engine.synchronize_and_block().unwrap();
    assert_eq!(group.member(1).payloads(CONTACT), vec!["again".to_string()]);
}

#[test]
fn second_engine_is_locked_out() {
    let group = TestGroup::on_disk(2, &[CONTACT]);
    let _engine = group.initialized_engine();
    let mut second = group.engine();
    assert!(matches!(
        second.initialize(group.proxies()),
        Err(EngineError::Locked)
    ));
    assert_eq!(second.state(), EngineState::Uninitialized);
}

#[test]
fn stale_lock_forces_slow_sync() {
    let group = TestGroup::on_disk(2, &[CONTACT]);
    let dir = group.config_dir().unwrap().to_path_buf();
    std::fs::write(dir.join("lock"), b"").unwrap();

    let mut engine = group.engine();
    let log = EventLog::attach(&engine);
    engine.initialize(group.proxies()).unwrap();
    assert_eq!(log.engine_events(), vec![EngineEvent::PrevUnclean]);

    group.member(0).add(CONTACT, "a1", "hello");
    engine.synchronize_and_block().unwrap();
    assert_eq!(group.member(0).last_slow_sync(), Some(true));
    assert_eq!(group.member(1).payloads(CONTACT), vec!["hello".to_string()]);

    engine.synchronize_and_block().unwrap();
    assert_eq!(group.member(0).last_slow_sync(), Some(false));
}

#[test]
fn abort_ends_a_blocked_session() {
    let group = TestGroup::in_memory(2, &[CONTACT]);
    let engine = group.initialized_engine();
    let log = EventLog::attach(&engine);
    let (tx, rx) = mpsc::channel();
    engine.set_conflict_callback(move |conflict: &MappingConflict| {
        let _ = tx.send(conflict.mapping_id);
    });
    baseline(&group, &engine);
    let uid = member_uid(&group, 1);

    group.member(0).modify(CONTACT, "a1", "x");
    group.member(1).modify(CONTACT, &uid, "y");
    engine.synchronize().unwrap();
    assert!(matches!(engine.synchronize(), Err(EngineError::Busy)));
    rx.recv_timeout(Duration::from_secs(5)).unwrap();

    engine.abort().unwrap();
    let err = engine.wait_sync_end().unwrap_err();
    assert_eq!(err.root_cause().to_string(), "Synchronization aborted");
    assert!(log.engine_events().contains(&EngineEvent::Error));
    assert_eq!(group.member(1).payloads(CONTACT), vec!["y".to_string()]);
}

#[test]
fn unanswered_conflict_holds_the_session_until_abort() {
    let group = TestGroup::in_memory(2, &[CONTACT]);
    let engine = group.initialized_engine();
    let log = EventLog::attach(&engine);
    baseline(&group, &engine);
    let uid = member_uid(&group, 1);
    log.clear();

    group.member(0).modify(CONTACT, "a1", "x");
    group.member(1).modify(CONTACT, &uid, "y");
    engine.synchronize().unwrap();
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while !log.engine_events().contains(&EngineEvent::Read) {
        assert!(std::time::Instant::now() < deadline, "read phase never completed");
        std::thread::sleep(Duration::from_millis(5));
    }
    std::thread::sleep(Duration::from_millis(50));

    assert!(!log.engine_events().contains(&EngineEvent::Written));
    assert!(matches!(engine.synchronize(), Err(EngineError::Busy)));
    engine.abort().unwrap();
    let err = engine.wait_sync_end().unwrap_err();
    assert_eq!(err.root_cause().to_string(), "Synchronization aborted");
    assert_eq!(group.member(0).payloads(CONTACT), vec!["x".to_string()]);
    assert_eq!(group.member(1).payloads(CONTACT), vec!["y".to_string()]);
}

#[test]
fn status_callback_registers_another_callback() {
    let group = TestGroup::in_memory(2, &[CONTACT]);
    let engine = Arc::new(group.initialized_engine());
    let registry = Arc::downgrade(&engine);
    let members = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&members);
    engine.set_engine_status_callback(move |update: &EngineUpdate| {
        if update.event != EngineEvent::Connected {
            return;
        }
        if let Some(engine) = registry.upgrade() {
            let seen = Arc::clone(&seen);
            engine.set_member_status_callback(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            });
        }
    });

    group.member(0).add(CONTACT, "a1", "hello");
    let (tx, rx) = mpsc::channel();
    let session = Arc::clone(&engine);
    std::thread::spawn(move || {
        let _ = tx.send(session.synchronize_and_block());
    });
    rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();

    assert!(members.load(Ordering::SeqCst) > 0);
    assert_eq!(group.member(1).payloads(CONTACT), vec!["hello".to_string()]);
}

#[test]
fn finalize_gives_up_on_silent_members() {
    let group = TestGroup::in_memory(2, &[CONTACT])
        .with_config(EngineConfig::new().with_finalize_timeout(Duration::from_millis(50)));
    let mut engine = group.initialized_engine();
    let log = EventLog::attach(&engine);
    group.member(1).hold_finalize(true);

    engine.finalize().unwrap();
    assert_eq!(engine.state(), EngineState::Uninitialized);
    let timed_out = log
        .member_updates()
        .into_iter()
        .any(|u| u.member_id == 2 && u.error.as_deref() == Some("finalize timed out"));
    assert!(timed_out);
    assert_eq!(group.member(0).count(MockOp::Finalize), 1);
    group.member(1).release_finalize();
}

#[test]
fn discover_reports_member_objtypes() {
    let group = TestGroup::in_memory(2, &[CONTACT]);
    group.member(0).set_discovered(&[CONTACT, "event"]);
    let engine = group.initialized_engine();
    let log = EventLog::attach(&engine);

    let objtypes = engine.discover_and_block(1).unwrap();
    assert_eq!(objtypes, vec![CONTACT.to_string(), "event".to_string()]);
    assert_eq!(log.members_with(MemberEvent::Discovered), vec![1]);
    assert!(engine.discover_and_block(42).is_err());
}

#[test]
fn threaded_replies_are_joined() {
    let group = TestGroup::in_memory(3, &[CONTACT]);
    for member in group.members() {
        member.set_threaded(true);
    }
    let engine = group.initialized_engine();
    group.member(0).add(CONTACT, "a1", "one");
    group.member(1).add(CONTACT, "b1", "two");

    engine.synchronize_and_block().unwrap();
    let both = vec!["one".to_string(), "two".to_string()];
    for index in 0..3 {
        assert_eq!(group.member(index).payloads(CONTACT), both);
    }
}

#[test]
fn objtypes_are_synced_independently() {
    let group = TestGroup::in_memory(3, &[CONTACT, "event"]).restrict_member(2, &["event"]);
    let engine = group.initialized_engine();
    group.member(0).add(CONTACT, "a1", "card");
    group.member(2).add("event", "c1", "meeting");

    engine.synchronize_and_block().unwrap();
    assert_eq!(group.member(1).payloads(CONTACT), vec!["card".to_string()]);
    assert!(group.member(2).items(CONTACT).is_empty());
    assert_eq!(group.member(0).payloads("event"), vec!["meeting".to_string()]);
    assert_eq!(group.member(1).payloads("event"), vec!["meeting".to_string()]);
}

proptest! {
    #[test]
    fn conflict_check_keeps_master_xor_conflict(entries in mapping_entries_strategy(CONTACT, 3)) {
        let format = PlainFormat::new();
        let mut mapping = MappingEngine::empty(CONTACT, &[1, 2, 3]);
        for (pos, change) in entries.into_iter().enumerate() {
            mapping.update_entry(pos, change);
        }

        match mapping.check_conflict(&format) {
            ConflictCheck::Empty => prop_assert!(mapping.master().is_none()),
            ConflictCheck::Conflict => prop_assert!(mapping.master().is_none() && mapping.is_conflict()),
            ConflictCheck::Solved { synced } => {
                prop_assert!(mapping.master().is_some() && !mapping.is_conflict());
                mapping.multiply().unwrap();
                if !synced {
                    let master = mapping.master_entry().and_then(|e| e.change()).cloned().unwrap();
                    for entry in mapping.entries() {
                        let change = entry.change().unwrap();
                        prop_assert_eq!(&change.data, &master.data);
                    }
                }
            }
            ConflictCheck::Mastered => prop_assert!(false, "fresh mapping has no master"),
        }
    }

    #[test]
    fn latest_entry_is_unique_maximum(entries in revisioned_entries_strategy(CONTACT, 3)) {
        let format = PlainFormat::new();
        let mut mapping = MappingEngine::empty(CONTACT, &[1, 2, 3]);
        let max = entries.iter().filter_map(|c| c.revision).max().unwrap();
        let at_max = entries.iter().filter(|c| c.revision == Some(max)).count();
        for (pos, change) in entries.into_iter().enumerate() {
            mapping.update_entry(pos, Some(change));
        }

        match mapping.latest_entry(&format) {
            Ok(pos) => {
                prop_assert_eq!(at_max, 1);
                prop_assert_eq!(mapping.entry(pos).unwrap().change().unwrap().revision, Some(max));
            }
            Err(EngineError::RevisionTie) => prop_assert!(at_max > 1),
            Err(other) => prop_assert!(false, "unexpected error: {}", other),
        }
    }
}
