//! Integration tests for the arena-store crate.
//!
//! These run against a real SQLite file on disk (via tempfile) and cover
//! optimistic concurrency, atomicity, ordered listing, and watches.

use std::sync::Arc;
use std::time::Duration;

use arena_store::{
    Commit, Database, Key, Kv, KvOptions, ListOptions, ListSelector, StoreError, Versionstamp,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Counter {
    value: i64,
}

async fn open_on_disk(dir: &tempfile::TempDir) -> Kv {
    Kv::open(dir.path().join("arena.db"), KvOptions::default())
        .await
        .unwrap()
}

// ═══════════════════════════════════════════════════════════════════════
//  Lifecycle
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn data_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let key = Key::from(["games", "g1"]);

    let kv = open_on_disk(&dir).await;
    let written = kv.set(key.clone(), &Counter { value: 3 }).await.unwrap();
    kv.close();
    drop(kv);

    let kv = open_on_disk(&dir).await;
    let entry = kv.get::<Counter>(&key).await.unwrap().unwrap();
    assert_eq!(entry.value.value, 3);
    assert_eq!(entry.versionstamp, written);

    // The commit sequence continues where it left off.
    let next = kv.set(key, &Counter { value: 4 }).await.unwrap();
    assert!(next > written);
}

#[tokio::test]
async fn migrate_twice_is_harmless() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("arena.db");
    drop(Database::open(&path).await.unwrap());
    let db = Database::open(&path).await.unwrap();

    let rows: i64 = db
        .read(|tx| Ok(tx.query_row("SELECT count(*) FROM kv", [], |row| row.get(0))?))
        .await
        .unwrap();
    assert_eq!(rows, 0);
}

// ═══════════════════════════════════════════════════════════════════════
//  Optimistic concurrency
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn racing_writers_with_same_versionstamp_one_wins() {
    let dir = tempfile::tempdir().unwrap();
    let kv = open_on_disk(&dir).await;
    let key = Key::from(["games", "contested"]);
    let read = kv.set(key.clone(), &Counter { value: 0 }).await.unwrap();

    let mut tasks = Vec::new();
    for i in 1..=8 {
        let kv = kv.clone();
        let key = key.clone();
        tasks.push(tokio::spawn(async move {
            kv.atomic()
                .check(key.clone(), Some(read))
                .set(key, &Counter { value: i })
                .commit()
                .await
                .unwrap()
        }));
    }

    let mut committed = 0;
    for task in tasks {
        if task.await.unwrap().is_committed() {
            committed += 1;
        }
    }
    assert_eq!(committed, 1);
}

#[tokio::test]
async fn read_modify_write_loop_loses_no_increments() {
    let dir = tempfile::tempdir().unwrap();
    let kv = open_on_disk(&dir).await;
    let key = Key::from(["counter"]);
    kv.set(key.clone(), &Counter { value: 0 }).await.unwrap();

    let mut tasks = Vec::new();
    for _ in 0..10 {
        let kv = kv.clone();
        let key = key.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                let entry = kv.get::<Counter>(&key).await.unwrap().unwrap();
                let next = Counter {
                    value: entry.value.value + 1,
                };
                let commit = kv
                    .atomic()
                    .check(key.clone(), Some(entry.versionstamp))
                    .set(key.clone(), &next)
                    .commit()
                    .await
                    .unwrap();
                if commit.is_committed() {
                    break;
                }
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let entry = kv.get::<Counter>(&key).await.unwrap().unwrap();
    assert_eq!(entry.value.value, 10);
}

#[tokio::test]
async fn failed_check_applies_no_mutation() {
    let dir = tempfile::tempdir().unwrap();
    let kv = open_on_disk(&dir).await;
    let guarded = Key::from(["games", "g1"]);
    let index = Key::from(["games_by_user", "u1", "g1"]);
    kv.set(guarded.clone(), &1).await.unwrap();

    let commit = kv
        .atomic()
        .check(guarded.clone(), None)
        .set(guarded.clone(), &2)
        .set(index.clone(), &2)
        .commit()
        .await
        .unwrap();

    assert_eq!(commit, Commit::Conflict);
    assert_eq!(kv.get::<i32>(&guarded).await.unwrap().unwrap().value, 1);
    assert!(kv.get::<i32>(&index).await.unwrap().is_none());
}

#[tokio::test]
async fn all_mutations_share_one_versionstamp() {
    let dir = tempfile::tempdir().unwrap();
    let kv = open_on_disk(&dir).await;
    let keys = [Key::from(["a"]), Key::from(["b"]), Key::from(["c"])];

    let commit = kv
        .atomic()
        .set(keys[0].clone(), &1)
        .set(keys[1].clone(), &2)
        .set(keys[2].clone(), &3)
        .commit()
        .await
        .unwrap();
    let stamp = commit.versionstamp().unwrap();

    let entries = kv.get_many::<i32>(&keys).await.unwrap();
    for entry in entries {
        assert_eq!(entry.unwrap().versionstamp, stamp);
    }
}

#[tokio::test]
async fn versionstamp_round_trips_through_text() {
    let dir = tempfile::tempdir().unwrap();
    let kv = open_on_disk(&dir).await;
    let stamp = kv.set(Key::from(["k"]), &1).await.unwrap();

    let text = stamp.to_string();
    assert_eq!(text.len(), 20);
    assert_eq!(text.parse::<Versionstamp>().unwrap(), stamp);
}

// ═══════════════════════════════════════════════════════════════════════
//  Listing
// ═══════════════════════════════════════════════════════════════════════

async fn seed_player_index(kv: &Kv) {
    for (user, game) in [("u1", "g3"), ("u1", "g1"), ("u2", "g9"), ("u1", "g2")] {
        kv.set(Key::from(["games_by_user", user, game]), &game)
            .await
            .unwrap();
    }
    // Sibling prefix that must never leak into `["games_by_user", "u1"]`.
    kv.set(Key::from(["games_by_user", "u10", "g7"]), &"g7")
        .await
        .unwrap();
}

#[tokio::test]
async fn prefix_listing_is_ordered_and_scoped() {
    let dir = tempfile::tempdir().unwrap();
    let kv = open_on_disk(&dir).await;
    seed_player_index(&kv).await;

    let games: Vec<String> = kv
        .list(ListSelector::prefix(["games_by_user", "u1"]), ListOptions::default())
        .unwrap()
        .values()
        .await
        .unwrap();
    assert_eq!(games, vec!["g1", "g2", "g3"]);
}

#[tokio::test]
async fn reverse_limited_listing_pages_correctly() {
    let dir = tempfile::tempdir().unwrap();
    let kv = open_on_disk(&dir).await;
    for i in 0..25_i64 {
        kv.set(Key::from(["seq"]).with(i), &i).await.unwrap();
    }

    let values: Vec<i64> = kv
        .list(
            ListSelector::prefix(["seq"]),
            ListOptions::default().reverse().limit(12).batch_size(5),
        )
        .unwrap()
        .values()
        .await
        .unwrap();
    assert_eq!(values, (13..25).rev().collect::<Vec<_>>());
}

#[tokio::test]
async fn small_batches_cover_the_whole_range() {
    let dir = tempfile::tempdir().unwrap();
    let kv = Kv::open(
        dir.path().join("arena.db"),
        KvOptions { list_batch_size: 3 },
    )
    .await
    .unwrap();
    for i in 0..10_i64 {
        kv.set(Key::from(["n", "x"]).with(i), &i).await.unwrap();
    }

    let values: Vec<i64> = kv
        .list(ListSelector::prefix(["n"]), ListOptions::default())
        .unwrap()
        .values()
        .await
        .unwrap();
    assert_eq!(values, (0..10).collect::<Vec<_>>());
}

#[tokio::test]
async fn range_listing_is_half_open() {
    let dir = tempfile::tempdir().unwrap();
    let kv = open_on_disk(&dir).await;
    for i in 0..5_i64 {
        kv.set(Key::from(["r"]).with(i), &i).await.unwrap();
    }

    let values: Vec<i64> = kv
        .list(
            ListSelector::range(Key::from(["r"]).with(1_i64), Key::from(["r"]).with(3_i64)),
            ListOptions::default(),
        )
        .unwrap()
        .values()
        .await
        .unwrap();
    assert_eq!(values, vec![1, 2]);
}

#[tokio::test]
async fn zero_batch_size_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let kv = open_on_disk(&dir).await;
    let result = kv.list::<i64>(
        ListSelector::prefix(["seq"]),
        ListOptions::default().batch_size(0),
    );
    assert!(matches!(result, Err(StoreError::InvalidArgument(_))));
}

// ═══════════════════════════════════════════════════════════════════════
//  Watches
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn watch_sees_commits_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let kv = open_on_disk(&dir).await;
    let key = Key::from(["games_by_user_updated", "u1"]);
    let mut stream = kv.watch(std::slice::from_ref(&key)).unwrap();

    let mut stamps = Vec::new();
    for i in 0..5_i64 {
        stamps.push(kv.set(key.clone(), &i).await.unwrap());
    }

    for (i, stamp) in stamps.into_iter().enumerate() {
        let event = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.versionstamp, stamp);
        assert_eq!(event.entries[0].value::<i64>().unwrap(), Some(i as i64));
    }
}

#[tokio::test]
async fn concurrent_commits_reach_watchers_in_versionstamp_order() {
    let dir = tempfile::tempdir().unwrap();
    let kv = open_on_disk(&dir).await;
    let key = Key::from(["hot"]);
    let mut stream = kv.watch(std::slice::from_ref(&key)).unwrap();

    let kv = Arc::new(kv);
    let mut tasks = Vec::new();
    for i in 0..20_i64 {
        let kv = Arc::clone(&kv);
        let key = key.clone();
        tasks.push(tokio::spawn(async move { kv.set(key, &i).await.unwrap() }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let mut last = None;
    for _ in 0..20 {
        let event = stream.recv().await.unwrap();
        if let Some(prev) = last {
            assert!(event.versionstamp > prev);
        }
        last = Some(event.versionstamp);
    }
}

#[tokio::test]
async fn watch_registration_is_released() {
    let dir = tempfile::tempdir().unwrap();
    let kv = open_on_disk(&dir).await;

    let first = kv.watch(&[Key::from(["a"])]).unwrap();
    let second = kv.watch(&[Key::from(["a"]), Key::from(["b"])]).unwrap();
    assert_eq!(kv.active_watches(), 2);

    first.cancel();
    assert_eq!(kv.active_watches(), 1);
    drop(second);
    assert_eq!(kv.active_watches(), 0);
}

#[tokio::test]
async fn close_ends_watches() {
    let dir = tempfile::tempdir().unwrap();
    let kv = open_on_disk(&dir).await;
    let mut stream = kv.watch(&[Key::from(["a"])]).unwrap();

    kv.close();
    assert!(stream.next().await.is_none());
    assert_eq!(kv.active_watches(), 0);
}
