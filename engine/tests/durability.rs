//! Restart and crash recovery against an on-disk database.

mod common;

use common::{status, Harness, MockRemote};
use custody_engine::{Database, EntryState, Operation, SyncConfig};
use std::path::Path;

fn reopen(path: &Path, remote: std::sync::Arc<MockRemote>) -> Harness {
    Harness::build(SyncConfig::default(), Database::open(path).unwrap(), remote)
}

#[tokio::test]
async fn queued_mutations_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("custody.db");
    let remote = MockRemote::new();
    remote.set_online(false);

    let created = {
        let h = reopen(&path, remote.clone());
        let created = h.engine.create("tools", "42", status("available")).unwrap();
        h.engine.create("tools", "43", status("available")).unwrap();
        h.engine.delete("tools", "43").unwrap();
        created
    };

    let h = reopen(&path, remote.clone());
    assert_eq!(h.engine.status().queue_length, 2);
    assert_eq!(h.engine.get("tools", "42").unwrap(), Some(created.clone()));
    assert_eq!(h.engine.get("tools", "43").unwrap(), None);
    let ops: Vec<_> = h
        .engine
        .queue()
        .entries()
        .unwrap()
        .into_iter()
        .map(|e| e.operation)
        .collect();
    assert_eq!(ops, vec![Operation::Create, Operation::Delete]);

    h.settle_online().await;
    assert_eq!(remote.record("tools", "42"), Some(created));
    assert_eq!(h.engine.status().queue_length, 0);
}

#[tokio::test]
async fn borrowed_entries_return_after_crash() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("custody.db");
    let remote = MockRemote::new();

    {
        let h = reopen(&path, remote.clone());
        h.engine.create("tools", "1", status("available")).unwrap();
        h.engine.create("tools", "2", status("available")).unwrap();
        // a drain borrowed both, then the process died
        let borrowed = h.engine.queue().peek_batch(10).unwrap();
        assert_eq!(borrowed.len(), 2);
    }

    let h = reopen(&path, remote.clone());
    let entries = h.engine.queue().entries().unwrap();
    assert_eq!(entries.len(), 2);
    assert!(entries.iter().all(|e| e.state == EntryState::Pending));
    assert_eq!(entries[0].record_id, "1");

    h.settle_online().await;
    assert!(h.engine.queue().is_empty().unwrap());
    assert!(remote.record("tools", "1").is_some());
    assert!(remote.record("tools", "2").is_some());
}

#[tokio::test]
async fn cursor_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("custody.db");
    let remote = MockRemote::new();

    let cursor = {
        let h = reopen(&path, remote.clone());
        h.settle_online().await;
        h.engine.create("tools", "1", status("available")).unwrap();
        h.engine.sync_now().await.unwrap();
        h.engine.store().sync_cursor().unwrap()
    };
    assert!(cursor.is_some());

    let h = reopen(&path, remote.clone());
    assert_eq!(h.engine.store().sync_cursor().unwrap(), cursor);
    // the durable cursor is not a sync this session
    assert_eq!(h.engine.status().last_sync_time, None);

    h.settle_online().await;
    let report = h.engine.sync_now().await.unwrap();
    assert_eq!(report.pulled, 0);
}

#[tokio::test]
async fn escalated_entries_and_conflicts_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("custody.db");
    let remote = MockRemote::new();
    let config = SyncConfig {
        retry: custody_engine::RetryPolicy {
            base_delay_ms: 0,
            max_exponent: 0,
            max_attempts: 1,
        },
        ..SyncConfig::default()
    };

    {
        let h = Harness::build(config.clone(), Database::open(&path).unwrap(), remote.clone());
        h.settle_online().await;
        remote.reject("tools", "bad");
        h.engine.create("tools", "bad", status("available")).unwrap();
        h.engine.create("tools", "t", status("available")).unwrap();
        h.engine.sync_now().await.unwrap();

        h.clock.set(2_000);
        h.engine.update("tools", "t", status("checked_out")).unwrap();
        remote.seed(custody_engine::Record::new("tools", "t", status("retired"), 9_000));
        h.engine.sync_now().await.unwrap();
        assert_eq!(h.engine.status().pending_review, 2);
    }

    let h = Harness::build(config, Database::open(&path).unwrap(), remote.clone());
    assert_eq!(h.engine.needs_review().unwrap().len(), 1);
    assert_eq!(h.engine.conflicts().unwrap().len(), 1);
    assert_eq!(h.engine.status().pending_review, 2);
    assert_eq!(h.engine.status().queue_length, 0);
}
