//! Replica reconciliation scenarios: two copies of one database diverge and
//! are merged back together.

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use strongroom_merge::Merger;
use strongroom_model::times::now_truncated;
use strongroom_model::{Database, DeletedObject, Entry, Group, MergeMode};

fn base() -> DateTime<Utc> {
    now_truncated() - Duration::hours(1)
}

fn at(seconds: i64) -> DateTime<Utc> {
    base() + Duration::seconds(seconds)
}

/// One database with a single entry "Bank", then a second replica of it.
fn replicas() -> (Database, Database, Uuid) {
    let mut db = Database::new();
    db.set_emit_modified(false);
    let root = db.root().uuid();
    let mut entry = Entry::new();
    entry.set_title("Bank");
    entry.set_username("alice");
    entry.set_password("hunter2");
    entry.times_mut().last_modification_time = at(0);
    entry.times_mut().location_changed = at(0);
    let uuid = db.add_entry(root, entry).unwrap();
    db.find_entry_mut(uuid).unwrap().times_mut().location_changed = at(0);

    let replica = db.clone();
    (db, replica, uuid)
}

/// Edit an entry the way a client would, but with a controlled timestamp.
fn edit_at(db: &mut Database, uuid: Uuid, stamp: DateTime<Utc>, edit: impl FnOnce(&mut Entry)) {
    let entry = db.find_entry_mut(uuid).unwrap();
    entry.push_current_to_history();
    edit(entry);
    entry.times_mut().last_modification_time = stamp;
}

fn entry_signature(db: &Database) -> Vec<(Uuid, String, String, usize)> {
    let mut rows: Vec<_> = db
        .root()
        .iter_entries()
        .map(|e| {
            (
                e.uuid(),
                e.title().to_string(),
                e.password().to_string(),
                e.history().len(),
            )
        })
        .collect();
    rows.sort();
    rows
}

fn tombstone_signature(db: &Database) -> Vec<(Uuid, DateTime<Utc>)> {
    let mut rows: Vec<_> = db
        .deleted_objects()
        .iter()
        .map(|d| (d.uuid, d.deletion_time))
        .collect();
    rows.sort();
    rows
}

#[test]
fn concurrent_edits_synchronize_with_newest_on_top() {
    let (mut a, mut b, uuid) = replicas();

    // A renames at t=10, B changes the password at t=11
    edit_at(&mut a, uuid, at(10), |e| e.set_title("X"));
    edit_at(&mut b, uuid, at(11), |e| e.set_password("n3w-p4ss"));

    let summary = Merger::new().merge(&mut a, &b).unwrap();
    assert!(summary.entries_merged >= 1);

    let merged = a.find_entry(uuid).unwrap();
    assert_eq!(merged.password(), "n3w-p4ss", "newer password wins the top");
    assert_eq!(merged.title(), "Bank", "B never saw the rename");
    assert_eq!(merged.last_modified(), at(11));
    assert!(
        merged.history().iter().any(|h| h.title() == "X"),
        "the rename is demoted into history"
    );
}

#[test]
fn deletion_beats_older_modification() {
    let (mut a, mut b, uuid) = replicas();

    // B modifies at t=15; A deletes permanently at t=20
    edit_at(&mut b, uuid, at(15), |e| e.set_notes("late edit"));
    a.remove_entry(uuid).unwrap();
    a.add_deleted_object(DeletedObject {
        uuid,
        deletion_time: at(20),
    });

    Merger::new().merge(&mut a, &b).unwrap();

    assert!(a.find_entry(uuid).is_none(), "tombstone wins");
    assert_eq!(a.deleted_object(uuid).unwrap().deletion_time, at(20));
}

#[test]
fn modification_after_deletion_resurrects() {
    let (mut a, mut b, uuid) = replicas();

    // A deletes at t=20, but B keeps editing until t=25
    a.remove_entry(uuid).unwrap();
    a.add_deleted_object(DeletedObject {
        uuid,
        deletion_time: at(20),
    });
    edit_at(&mut b, uuid, at(25), |e| e.set_notes("still alive"));

    Merger::new().merge(&mut a, &b).unwrap();

    let entry = a.find_entry(uuid).expect("newer modification survives");
    assert_eq!(entry.notes(), "still alive");
    assert!(
        !a.contains_deleted_object(uuid),
        "no tombstone may shadow a live object"
    );
}

#[test]
fn merge_is_idempotent() {
    let (mut a, mut b, uuid) = replicas();
    edit_at(&mut a, uuid, at(10), |e| e.set_title("A-side"));
    edit_at(&mut b, uuid, at(11), |e| e.set_title("B-side"));
    let root_b = b.root().uuid();
    let extra = b.add_group(root_b, Group::new("New In B")).unwrap();
    b.find_group_mut(extra).unwrap().times_mut().last_modification_time = at(5);

    Merger::new().merge(&mut a, &b).unwrap();
    let first_entries = entry_signature(&a);
    let first_tombstones = tombstone_signature(&a);
    let first_groups = a.root().group_count_recursive();

    Merger::new().merge(&mut a, &b).unwrap();
    assert_eq!(entry_signature(&a), first_entries);
    assert_eq!(tombstone_signature(&a), first_tombstones);
    assert_eq!(a.root().group_count_recursive(), first_groups);
}

#[test]
fn synchronize_merge_commutes() {
    let (mut a, mut b, uuid) = replicas();
    edit_at(&mut a, uuid, at(10), |e| e.set_title("from A"));
    edit_at(&mut b, uuid, at(20), |e| e.set_password("from B"));

    let mut ab = a.clone();
    Merger::new().merge(&mut ab, &b).unwrap();
    let mut ba = b.clone();
    Merger::new().merge(&mut ba, &a).unwrap();

    assert_eq!(entry_signature(&ab), entry_signature(&ba));
    assert_eq!(tombstone_signature(&ab), tombstone_signature(&ba));
}

#[test]
fn missing_groups_are_created_with_ancestors() {
    let (mut a, mut b, _) = replicas();
    let root_b = b.root().uuid();
    let outer = b.add_group(root_b, Group::new("Outer")).unwrap();
    let inner = b.add_group(outer, Group::new("Inner")).unwrap();
    let mut entry = Entry::new();
    entry.set_title("Nested Secret");
    let nested = b.add_entry(inner, entry).unwrap();

    let summary = Merger::new().merge(&mut a, &b).unwrap();
    assert_eq!(summary.groups_added, 2);
    assert_eq!(summary.entries_added, 1);
    assert_eq!(a.hierarchy(inner).unwrap(), ["Outer", "Inner"]);
    assert_eq!(
        a.parent_of_entry(nested).unwrap().uuid(),
        inner,
        "entry lands in its hierarchical position"
    );
}

#[test]
fn newer_location_change_wins_parenting() {
    let (mut a, mut b, uuid) = replicas();
    let root_a = a.root().uuid();
    let shared = Group::new("Shared Folder");
    let shared_uuid = shared.uuid();
    a.add_group(root_a, shared.clone()).unwrap();
    let root_b = b.root().uuid();
    b.add_group(root_b, shared).unwrap();

    // B moves the entry later than any location change in A
    b.relocate_entry(uuid, shared_uuid).unwrap();
    b.find_entry_mut(uuid).unwrap().times_mut().location_changed =
        now_truncated() + Duration::seconds(30);

    let summary = Merger::new().merge(&mut a, &b).unwrap();
    assert_eq!(summary.entries_relocated, 1);
    assert_eq!(a.parent_of_entry(uuid).unwrap().uuid(), shared_uuid);
}

#[test]
fn keep_local_appends_remote_to_history_only() {
    let (mut a, mut b, uuid) = replicas();
    edit_at(&mut a, uuid, at(10), |e| e.set_title("local"));
    edit_at(&mut b, uuid, at(20), |e| e.set_title("remote"));

    Merger::with_mode(MergeMode::KeepLocal)
        .merge(&mut a, &b)
        .unwrap();

    let entry = a.find_entry(uuid).unwrap();
    assert_eq!(entry.title(), "local", "local stays on top");
    assert!(entry.history().iter().any(|h| h.title() == "remote"));
}

#[test]
fn keep_remote_overwrites_and_preserves_former_state() {
    let (mut a, mut b, uuid) = replicas();
    edit_at(&mut a, uuid, at(20), |e| e.set_title("local newer"));
    edit_at(&mut b, uuid, at(10), |e| e.set_title("remote older"));

    Merger::with_mode(MergeMode::KeepRemote)
        .merge(&mut a, &b)
        .unwrap();

    let entry = a.find_entry(uuid).unwrap();
    assert_eq!(entry.title(), "remote older", "remote wins regardless of age");
    assert!(entry.history().iter().any(|h| h.title() == "local newer"));
}

#[test]
fn duplicate_mode_keeps_both_under_new_identity() {
    let (mut a, mut b, uuid) = replicas();
    edit_at(&mut a, uuid, at(10), |e| e.set_password("ours"));
    edit_at(&mut b, uuid, at(20), |e| e.set_password("theirs"));

    let summary = Merger::with_mode(MergeMode::Duplicate)
        .merge(&mut a, &b)
        .unwrap();
    assert_eq!(summary.entries_duplicated, 1);

    assert_eq!(a.find_entry(uuid).unwrap().password(), "ours");
    let twin = a
        .root()
        .iter_entries()
        .find(|e| e.uuid() != uuid && e.title() == "Bank")
        .expect("conflicting state kept as a new entry");
    assert_eq!(twin.password(), "theirs");
}

#[test]
fn duplicate_mode_honors_tombstones() {
    let (mut a, mut b, uuid) = replicas();
    edit_at(&mut b, uuid, at(10), |e| e.set_password("zombie"));
    a.remove_entry(uuid).unwrap();
    a.add_deleted_object(DeletedObject {
        uuid,
        deletion_time: at(20),
    });

    let summary = Merger::with_mode(MergeMode::Duplicate)
        .merge(&mut a, &b)
        .unwrap();
    assert_eq!(summary.entries_duplicated, 0);
    assert_eq!(
        a.root().entry_count_recursive(),
        0,
        "a tombstoned entry must not come back as a duplicate"
    );
}

#[test]
fn tombstone_invariant_holds_after_merge() {
    let (mut a, mut b, uuid) = replicas();
    // diverge: B deletes, A edits later; plus B gains a new entry that A
    // already tombstoned even later
    edit_at(&mut a, uuid, at(30), |e| e.set_notes("kept"));
    b.remove_entry(uuid).unwrap();
    b.add_deleted_object(DeletedObject {
        uuid,
        deletion_time: at(20),
    });

    let root_b = b.root().uuid();
    let mut ghost = Entry::new();
    ghost.times_mut().last_modification_time = at(5);
    let ghost_uuid = b.add_entry(root_b, ghost).unwrap();
    b.find_entry_mut(ghost_uuid)
        .unwrap()
        .times_mut()
        .last_modification_time = at(5);
    a.add_deleted_object(DeletedObject {
        uuid: ghost_uuid,
        deletion_time: at(9),
    });

    Merger::new().merge(&mut a, &b).unwrap();

    for tombstone in a.deleted_objects() {
        assert!(
            !a.contains_uuid(tombstone.uuid),
            "live object {} still tombstoned",
            tombstone.uuid
        );
    }
    assert!(a.find_entry(uuid).is_some(), "newer edit survives deletion");
    assert!(a.find_entry(ghost_uuid).is_none(), "older entry stays dead");
}

#[test]
fn history_stays_chronologically_ordered_and_bounded() {
    let (mut a, mut b, uuid) = replicas();
    a.metadata_mut().history_max_items = 4;
    for i in 0..6 {
        edit_at(&mut a, uuid, at(10 + i), |e| e.set_notes(format!("a{i}")));
    }
    for i in 0..6 {
        edit_at(&mut b, uuid, at(40 + i), |e| e.set_notes(format!("b{i}")));
    }

    Merger::new().merge(&mut a, &b).unwrap();

    let entry = a.find_entry(uuid).unwrap();
    assert!(entry.history().len() <= 4);
    let stamps: Vec<_> = entry.history().iter().map(|h| h.last_modified()).collect();
    let mut sorted = stamps.clone();
    sorted.sort();
    assert_eq!(stamps, sorted, "history must be chronologically ascending");
    assert_eq!(entry.notes(), "b5");
}
