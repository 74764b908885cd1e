use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tempfile::tempdir;
use uuid::Uuid;

use tarn::{
    Config, Database, Entry, IndexKind, LockManager, LockMode, RecoveryManager, Resource,
    TarnError, TransactionManager,
};

type Engine = (
    Arc<Database>,
    Arc<TransactionManager>,
    Arc<RecoveryManager>,
);

fn open_engine(dir: &Path) -> Engine {
    let db = tarn::prime(dir, Config::default()).expect("prime database");
    let tm = TransactionManager::new(Arc::new(LockManager::new()));
    let rm = RecoveryManager::new(Arc::clone(&db), Arc::clone(&tm)).expect("recovery manager");
    rm.recover().expect("recover");
    (db, tm, rm)
}

#[test]
fn btree_inserts_select_in_key_order() {
    let dir = tempdir().expect("temp dir");
    let data = dir.path().join("data");
    let (db, _tm, rm) = open_engine(&data);
    let client = Uuid::new_v4();
    rm.logged_create_table("t", IndexKind::BTree).expect("create");
    for (key, value) in [(1, 10), (2, 20), (3, 30)] {
        rm.logged_insert(client, "t", key, value).expect("insert");
    }
    let entries = db.get_table("t").expect("t").select().expect("select");
    assert_eq!(
        entries,
        vec![
            Entry { key: 1, value: 10 },
            Entry { key: 2, value: 20 },
            Entry { key: 3, value: 30 },
        ]
    );
}

#[test]
fn hash_table_serves_a_thousand_keys() {
    let dir = tempdir().expect("temp dir");
    let (db, _tm, rm) = open_engine(&dir.path().join("data"));
    let client = Uuid::new_v4();
    rm.logged_create_table("h", IndexKind::Hash).expect("create");
    for key in 1..=1000i64 {
        rm.logged_insert(client, "h", key, key).expect("insert");
    }
    let table = db.get_table("h").expect("h");
    for key in 1..=1000i64 {
        assert_eq!(table.find(key).expect("find"), key);
    }
}

#[test]
fn cross_requests_detect_deadlock_and_loser_backs_off() {
    let dir = tempdir().expect("temp dir");
    let (_db, tm, rm) = open_engine(&dir.path().join("data"));
    rm.logged_create_table("t", IndexKind::BTree).expect("create");
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();
    rm.begin_transaction(a).expect("begin a");
    rm.begin_transaction(b).expect("begin b");
    tm.lock(a, &Resource::new("t", 5), LockMode::Exclusive)
        .expect("a locks 5");
    tm.lock(b, &Resource::new("t", 6), LockMode::Exclusive)
        .expect("b locks 6");

    let tm_a = Arc::clone(&tm);
    let blocked = thread::spawn(move || tm_a.lock(a, &Resource::new("t", 6), LockMode::Exclusive));
    thread::sleep(Duration::from_millis(50));

    let result = tm.lock(b, &Resource::new("t", 5), LockMode::Exclusive);
    assert!(matches!(result, Err(TarnError::Deadlock)));

    rm.rollback(b).expect("b rolls back");
    blocked
        .join()
        .expect("blocked thread")
        .expect("a proceeds after b releases");
    rm.commit_transaction(a).expect("commit a");
}

#[test]
fn loser_transaction_is_undone_to_the_checkpoint() {
    let dir = tempdir().expect("temp dir");
    let data = dir.path().join("data");
    let client = Uuid::new_v4();
    {
        let (_db, _tm, rm) = open_engine(&data);
        rm.logged_create_table("t", IndexKind::BTree).expect("create");
        rm.begin_transaction(client).expect("begin");
        rm.logged_insert(client, "t", 1, 100).expect("insert 1");
        rm.checkpoint().expect("checkpoint");
        rm.logged_insert(client, "t", 2, 200).expect("insert 2");
        // Dropped without commit or flush: the process dies here.
    }
    let (db, _tm, _rm) = open_engine(&data);
    let table = db.get_table("t").expect("t");
    assert_eq!(table.find(1).expect("find 1"), 100);
    assert!(matches!(table.find(2), Err(TarnError::NotFound("key"))));
}

#[test]
fn committed_and_autocommit_edits_survive_a_crash() {
    let dir = tempdir().expect("temp dir");
    let data = dir.path().join("data");
    let tx_client = Uuid::new_v4();
    let bare_client = Uuid::new_v4();
    {
        let (_db, _tm, rm) = open_engine(&data);
        rm.logged_create_table("t", IndexKind::BTree).expect("create");
        rm.begin_transaction(tx_client).expect("begin");
        rm.logged_insert(tx_client, "t", 1, 100).expect("insert 1");
        rm.commit_transaction(tx_client).expect("commit");
        rm.logged_insert(bare_client, "t", 2, 200)
            .expect("insert outside transaction");
    }
    let (db, _tm, _rm) = open_engine(&data);
    let table = db.get_table("t").expect("t");
    assert_eq!(table.find(1).expect("find 1"), 100);
    assert_eq!(table.find(2).expect("find 2"), 200);
}

#[test]
fn rollback_leaves_state_as_if_never_begun() {
    let dir = tempdir().expect("temp dir");
    let (db, tm, rm) = open_engine(&dir.path().join("data"));
    let setup = Uuid::new_v4();
    rm.logged_create_table("t", IndexKind::BTree).expect("create");
    for key in 0..10i64 {
        rm.logged_insert(setup, "t", key, key * 10).expect("seed");
    }
    let before = db.get_table("t").expect("t").select().expect("select");

    let client = Uuid::new_v4();
    rm.begin_transaction(client).expect("begin");
    rm.logged_insert(client, "t", 42, 420).expect("insert");
    rm.logged_update(client, "t", 3, -1).expect("update");
    rm.logged_delete(client, "t", 7).expect("delete");
    rm.rollback(client).expect("rollback");

    let after = db.get_table("t").expect("t").select().expect("select");
    assert_eq!(before, after);
    assert!(!tm.has_transaction(client));

    // The freed locks are immediately available to others.
    let other = Uuid::new_v4();
    rm.begin_transaction(other).expect("begin other");
    rm.logged_update(other, "t", 3, 33).expect("relock rolled-back key");
    rm.commit_transaction(other).expect("commit other");
}

#[test]
fn replay_without_checkpoint_rebuilds_from_empty_snapshot() {
    let dir = tempdir().expect("temp dir");
    let data = dir.path().join("data");
    {
        let (_db, _tm, rm) = open_engine(&data);
        rm.logged_create_table("t", IndexKind::Hash).expect("create");
        let client = Uuid::new_v4();
        for key in 0..50i64 {
            rm.logged_insert(client, "t", key, key + 1000).expect("insert");
        }
    }
    let (db, _tm, _rm) = open_engine(&data);
    let table = db.get_table("t").expect("t");
    for key in 0..50i64 {
        assert_eq!(table.find(key).expect("find"), key + 1000);
    }
}

#[test]
fn repeated_crashes_converge_to_the_same_state() {
    let dir = tempdir().expect("temp dir");
    let data = dir.path().join("data");
    let client = Uuid::new_v4();
    {
        let (_db, _tm, rm) = open_engine(&data);
        rm.logged_create_table("t", IndexKind::BTree).expect("create");
        for key in 0..20i64 {
            rm.logged_insert(client, "t", key, key).expect("insert");
        }
        rm.checkpoint().expect("checkpoint");
        for key in 20..40i64 {
            rm.logged_insert(client, "t", key, key).expect("insert");
        }
    }
    // Recover twice in a row; the second replay must be a no-op state-wise.
    for _ in 0..2 {
        let (db, _tm, _rm) = open_engine(&data);
        let entries = db.get_table("t").expect("t").select().expect("select");
        assert_eq!(entries.len(), 40);
        assert!(entries
            .iter()
            .enumerate()
            .all(|(i, entry)| entry.key == i as i64 && entry.value == i as i64));
    }
}
