//! End-to-end scenarios from spec.md §8, reproduced with their literal
//! inputs against the public `Coordinator`/`DeltaEngine`/`VectorClockManager`
//! surfaces.

use std::sync::Arc;
use syncd_coordinator::config::SyncConfig;
use syncd_coordinator::coordinator::Coordinator;
use syncd_coordinator::delta::{sha256_hex, DeltaEngine};
use syncd_coordinator::models::{current_time_millis, Event, EventPayload};
use syncd_coordinator::persistence::Persistence;
use syncd_coordinator::vector_clock::{ClockComparison, VectorClock, VectorClockManager};

async fn test_coordinator() -> Coordinator {
    let persistence = Arc::new(Persistence::connect("sqlite::memory:").await.unwrap());
    Coordinator::new(persistence, SyncConfig { replication_progress_delay_ms: 0, ..SyncConfig::default() }).await
}

/// S1 — Initial upload.
#[tokio::test]
async fn s1_initial_upload() {
    let coordinator = test_coordinator().await;
    coordinator.register_node("n1", "laptop", "127.0.0.1", 9000, vec![], vec![]).await.unwrap();

    let bytes = b"hello world".to_vec();
    let result = coordinator
        .upload_file("n1", "f1", "f1.txt", "/f1.txt", "text/plain", bytes.clone())
        .await
        .unwrap();

    let file = coordinator.get_file("f1").await.unwrap();
    assert_eq!(file.version_number, 1);
    assert_eq!(file.content_hash, sha256_hex(b"hello world"));
    assert_eq!(coordinator.get_delta_metrics().bandwidth_saved, 0);
    assert_eq!(result.vector_clock.get("n1"), 2);

    let events = coordinator.list_events(10).await.unwrap();
    let modified: Vec<&Event> = events.iter().filter(|e| e.payload.kind() == "file_modified").collect();
    assert_eq!(modified.len(), 1);
    assert_eq!(modified[0].vector_clock.get("n1"), 2);
}

/// S2 — Small edit, both chunk-size regimes.
#[test]
fn s2_small_edit_large_chunks() {
    let engine = DeltaEngine::new(4096);
    let old = b"hello world".to_vec();
    let new = b"hello wOrld".to_vec();
    let delta = engine.compute_delta(&old, &new, Some("f1".to_string()));

    assert_eq!(delta.chunks_to_add.len(), 1);
    assert_eq!(delta.chunks_to_add[0].size, 11);
    assert!(delta.unchanged_indices.is_empty());
    assert_eq!(delta.bandwidth_saved, 0);
}

#[test]
fn s2_small_edit_small_chunks() {
    let engine = DeltaEngine::new(4);
    let old = b"hello world".to_vec();
    let new = b"hello wOrld".to_vec();
    let delta = engine.compute_delta(&old, &new, Some("f1".to_string()));

    assert_eq!(delta.chunks_to_add.len(), 1);
    assert_eq!(delta.chunks_to_add[0].offset, 4);

    let unchanged_offsets: Vec<usize> = delta
        .copy_ops
        .iter()
        .map(|c| c.new_offset)
        .collect();
    assert!(unchanged_offsets.contains(&0));
    assert!(unchanged_offsets.contains(&8));
}

/// S3 — Replication fans a single upload out to every other online node.
#[tokio::test]
async fn s3_replication_fans_out_to_peers() {
    let coordinator = test_coordinator().await;
    coordinator.register_node("n1", "one", "127.0.0.1", 9001, vec![], vec![]).await.unwrap();
    coordinator.register_node("n2", "two", "127.0.0.1", 9002, vec![], vec![]).await.unwrap();
    coordinator.register_node("n3", "three", "127.0.0.1", 9003, vec![], vec![]).await.unwrap();

    coordinator
        .upload_file("n1", "f1", "f1.txt", "/f1.txt", "text/plain", b"hello world".to_vec())
        .await
        .unwrap();

    // Replication runs on spawned tasks; give them a moment to finish
    // (progress delay is zeroed in test_coordinator).
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let events = coordinator.list_events(50).await.unwrap();
    let count = |kind: &str| events.iter().filter(|e| e.payload.kind() == kind).count();
    assert_eq!(count("file_modified"), 1);
    assert_eq!(count("sync_started"), 2);
    assert_eq!(count("sync_progress"), 6); // 3 steps x 2 peers
    assert_eq!(count("sync_completed"), 2);

    let n2_file = coordinator.get_file("f1::replica::n2").await.unwrap();
    let n3_file = coordinator.get_file("f1::replica::n3").await.unwrap();
    assert_eq!(n2_file.owner_node_id, "n2");
    assert_eq!(n3_file.owner_node_id, "n3");
}

/// S4 — Concurrent modification from two nodes is detected as a conflict.
#[tokio::test]
async fn s4_concurrent_modification_detected() {
    let coordinator = test_coordinator().await;
    coordinator.register_node("n1", "one", "127.0.0.1", 9001, vec![], vec![]).await.unwrap();
    coordinator.register_node("n2", "two", "127.0.0.1", 9002, vec![], vec![]).await.unwrap();

    let from_n1 = coordinator
        .upload_file("n1", "f1", "f1.txt", "/f1.txt", "text/plain", b"version a".to_vec())
        .await
        .unwrap();
    let from_n2 = coordinator
        .upload_file("n2", "f1", "f1.txt", "/f1.txt", "text/plain", b"version b".to_vec())
        .await
        .unwrap();

    assert_eq!(
        coordinator.clock_manager.compare(&from_n1.vector_clock, &from_n2.vector_clock),
        ClockComparison::Concurrent
    );

    let conflicts = coordinator.list_conflicts(Some("f1")).await.unwrap();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].node_a, "n1");
    assert_eq!(conflicts[0].node_b, "n2");
}

/// S5 — Delete then restore; both undelete variants.
#[tokio::test]
async fn s5_delete_then_restore_without_undelete() {
    let coordinator = test_coordinator().await;
    coordinator.register_node("n1", "one", "127.0.0.1", 9001, vec![], vec![]).await.unwrap();
    coordinator.upload_file("n1", "f1", "f1.txt", "/f1.txt", "text/plain", b"v1".to_vec()).await.unwrap();
    coordinator.upload_file("n1", "f1", "f1.txt", "/f1.txt", "text/plain", b"v2".to_vec()).await.unwrap();

    coordinator.delete_file("n1", "f1").await.unwrap();
    let after_delete = coordinator.get_file("f1").await.unwrap();
    assert!(after_delete.is_deleted);
    assert_eq!(coordinator.get_file_history("f1").len(), 2);

    let v1_id = coordinator.get_file_history("f1")[0].version_id.clone();
    let restored = coordinator.restore_version("n1", "f1", &v1_id, false).await.unwrap();
    assert_eq!(restored.version_number, 3);

    // Restore targets the version chain, not the tombstone: still deleted.
    let after_restore = coordinator.get_file("f1").await.unwrap();
    assert!(after_restore.is_deleted);

    let events = coordinator.list_events(10).await.unwrap();
    let restore_event = events
        .iter()
        .find(|e| matches!(&e.payload, EventPayload::FileModified { action: Some(a), .. } if a == "restored"))
        .expect("a file_modified event with action=restored");
    assert_eq!(restore_event.payload.kind(), "file_modified");
}

#[tokio::test]
async fn s5_restore_with_undelete_brings_file_back() {
    let coordinator = test_coordinator().await;
    coordinator.register_node("n1", "one", "127.0.0.1", 9001, vec![], vec![]).await.unwrap();
    coordinator.upload_file("n1", "f1", "f1.txt", "/f1.txt", "text/plain", b"v1".to_vec()).await.unwrap();
    coordinator.delete_file("n1", "f1").await.unwrap();

    let v1_id = coordinator.get_file_history("f1")[0].version_id.clone();
    coordinator.restore_version("n1", "f1", &v1_id, true).await.unwrap();

    let after_restore = coordinator.get_file("f1").await.unwrap();
    assert!(!after_restore.is_deleted);
    let (_, bytes) = coordinator.download_file("f1").await.unwrap();
    assert_eq!(bytes, b"v1".to_vec());
}

/// S6 — Causal sort over a fixed set of vector-clocked events.
#[test]
fn s6_causal_sort_orders_and_breaks_ties() {
    let manager = VectorClockManager::new();

    fn event_at(clocks: &[(&str, u64)], timestamp: i64, event_id: &str) -> Event {
        let mut vc = VectorClock::new();
        for (node, value) in clocks {
            vc.clocks.insert(node.to_string(), *value);
        }
        Event {
            event_id: event_id.to_string(),
            source_node_id: clocks.first().map(|(n, _)| n.to_string()).unwrap_or_default(),
            timestamp,
            vector_clock: vc,
            payload: EventPayload::NodeRegistered { node_id: "n1".to_string() },
            processed: false,
        }
    }

    let base = current_time_millis();
    let e1 = event_at(&[("n1", 1)], base, "e1");
    let e2 = event_at(&[("n1", 2)], base + 1, "e2");
    let e3 = event_at(&[("n2", 1)], base + 2, "e3");
    let e4 = event_at(&[("n1", 2), ("n2", 2)], base + 3, "e4");

    assert_eq!(e2.vector_clock.compare(&e3.vector_clock), ClockComparison::Concurrent);

    let sorted = manager.causal_sort(vec![e4.clone(), e3.clone(), e1.clone(), e2.clone()]);
    let order: Vec<&str> = sorted.iter().map(|e| e.event_id.as_str()).collect();

    let pos = |id: &str| order.iter().position(|x| *x == id).unwrap();
    assert!(pos("e1") < pos("e2"));
    assert!(pos("e1") < pos("e3"));
    assert!(pos("e2") < pos("e4"));
    assert!(pos("e3") < pos("e4"));
}
