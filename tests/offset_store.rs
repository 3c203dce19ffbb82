use anyhow::anyhow;
use bucketail::{pending_fingerprint, Durability, ObjectError, ObservedObject, OffsetStore, Progress, DB_FILE_NAME};
use chrono::{TimeZone, Utc};

fn observed(key: &str, size: u64, secs: i64, current: bool) -> ObservedObject {
    ObservedObject {
        bucket: "logs".into(),
        key: key.into(),
        size,
        modified: Utc.timestamp_opt(secs, 0).unwrap(),
        current,
    }
}

fn commit(store: &OffsetStore, rec: &bucketail::ObjectRecord, position: u64, last: &str) {
    let progress = Progress { position, last_line: last, first_line: rec.first_line.as_deref() };
    store
        .commit_record(rec, &progress, None, || Ok::<(), ObjectError>(()))
        .unwrap();
}

#[test]
fn new_objects_are_inserted_pending_and_read_from_zero() {
    let store = OffsetStore::open_in_memory().unwrap();
    let rec = store.reconcile_candidate(&observed("app/a.log", 10, 100, false)).unwrap().unwrap();
    assert_eq!(rec.position, 0);
    assert_eq!(rec.size, 10);
    assert_eq!(rec.modified, Utc.timestamp_opt(100, 0).unwrap(), "the worker sees the listed time");

    let row = store.get("logs", "app/a.log").unwrap().unwrap();
    assert_eq!(row.id, rec.id);
    assert_eq!(row.modified, pending_fingerprint(), "the row stays pending until finished");

    // Still pending: the same listing queues it again.
    assert!(store.reconcile_candidate(&observed("app/a.log", 10, 100, false)).unwrap().is_some());
    assert_eq!(store.all().unwrap().len(), 1, "no duplicate rows");
}

#[test]
fn finished_objects_are_skipped_until_they_change() {
    let store = OffsetStore::open_in_memory().unwrap();
    let mut rec = store.reconcile_candidate(&observed("app/a.log", 10, 100, false)).unwrap().unwrap();
    commit(&store, &rec, 10, "line");
    rec.first_line = Some("line".into());
    store.finish_object(&rec).unwrap();

    assert!(store.reconcile_candidate(&observed("app/a.log", 10, 100, false)).unwrap().is_none());

    let changed = store.reconcile_candidate(&observed("app/a.log", 25, 200, false)).unwrap().unwrap();
    assert_eq!(changed.position, 10, "resume from the committed position");
    assert_eq!(changed.size, 25);
    assert_eq!(changed.last_line.as_deref(), Some("line"));
    assert_eq!(changed.first_line.as_deref(), Some("line"));
}

#[test]
fn failed_emit_rolls_back_the_position() {
    let store = OffsetStore::open_in_memory().unwrap();
    let rec = store.reconcile_candidate(&observed("app/a.log", 10, 100, false)).unwrap().unwrap();
    let progress = Progress { position: 5, last_line: "abcd", first_line: Some("abcd") };

    let err = store
        .commit_record(&rec, &progress, None, || Err(ObjectError::Emit(anyhow!("sink full"))))
        .unwrap_err();
    assert!(matches!(err, ObjectError::Emit(_)));

    let row = store.get_by_id(rec.id).unwrap().unwrap();
    assert_eq!(row.position, 0);
    assert_eq!(row.last_line, None);
}

#[test]
fn position_never_moves_backwards() {
    let store = OffsetStore::open_in_memory().unwrap();
    let rec = store.reconcile_candidate(&observed("app/a.log", 10, 100, false)).unwrap().unwrap();
    commit(&store, &rec, 8, "second");
    commit(&store, &rec, 4, "first");
    assert_eq!(store.get_by_id(rec.id).unwrap().unwrap().position, 8);
}

#[test]
fn rotation_predecessor_matches_tail_continuations() {
    let store = OffsetStore::open_in_memory().unwrap();
    let mut old = store.reconcile_candidate(&observed("app/current.log", 30, 100, true)).unwrap().unwrap();
    old.first_line = Some("l1".into());
    commit(&store, &old, 30, "l3");

    // A new tail that starts where the old one stopped.
    let mut next = store.reconcile_candidate(&observed("app/current-2.log", 20, 200, true)).unwrap().unwrap();
    next.first_line = Some("l3".into());
    let prev = store.find_rotation_predecessor(&next, |_| true).unwrap().unwrap();
    assert_eq!(prev.id, old.id);

    // Non-current objects never look for one.
    next.current = false;
    assert!(store.find_rotation_predecessor(&next, |_| true).unwrap().is_none());

    // Zeroing happens inside the commit.
    next.current = true;
    let progress = Progress { position: 3, last_line: "l4", first_line: Some("l3") };
    store
        .commit_record(&next, &progress, Some(prev.id), || Ok::<(), ObjectError>(()))
        .unwrap();
    let zeroed = store.get_by_id(old.id).unwrap().unwrap();
    assert_eq!((zeroed.position, zeroed.size), (0, 0));
    assert_eq!(zeroed.last_line, None);
    assert!(store.find_rotation_predecessor(&next, |_| true).unwrap().is_none(), "a zeroed row is not matched again");
}

#[test]
fn rotation_predecessor_stays_within_bucket_and_stream() {
    let store = OffsetStore::open_in_memory().unwrap();
    let mut other = observed("app/web/current.log", 30, 100, true);
    other.bucket = "elsewhere".into();
    let mut elsewhere = store.reconcile_candidate(&other).unwrap().unwrap();
    elsewhere.first_line = Some("start".into());
    commit(&store, &elsewhere, 30, "banner");

    let mut web = store.reconcile_candidate(&observed("app/web/current.log", 30, 100, true)).unwrap().unwrap();
    web.first_line = Some("start".into());
    commit(&store, &web, 30, "banner");

    let mut db = store.reconcile_candidate(&observed("app/db/current-2.log", 20, 200, true)).unwrap().unwrap();
    db.first_line = Some("banner".into());
    let prev = store.find_rotation_predecessor(&db, |_| true).unwrap().unwrap();
    assert_eq!(prev.id, web.id, "rows of another bucket are never candidates");

    let same_dir = |row: &bucketail::ObjectRecord| row.key.starts_with("app/db/");
    assert!(store.find_rotation_predecessor(&db, same_dir).unwrap().is_none());
}

#[test]
fn store_persists_and_can_be_cleared() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = OffsetStore::open(dir.path(), Durability::Durable, false).unwrap();
        let rec = store.reconcile_candidate(&observed("app/a.log", 10, 100, false)).unwrap().unwrap();
        commit(&store, &rec, 10, "x");
        store.close().unwrap();
        assert!(store.is_closed());
        assert!(store.get("logs", "app/a.log").is_err(), "a closed store refuses work");
    }
    assert!(dir.path().join(DB_FILE_NAME).exists());

    let reopened = OffsetStore::open(dir.path(), Durability::Durable, false).unwrap();
    assert_eq!(reopened.get("logs", "app/a.log").unwrap().unwrap().position, 10);
    reopened.close().unwrap();

    let cleared = OffsetStore::open(dir.path(), Durability::Durable, true).unwrap();
    assert!(cleared.all().unwrap().is_empty());
}
