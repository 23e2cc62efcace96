//! Sync round scenarios against the in-process authority.

use super::utils::*;
use meshstore::chunking::{build_merkle_tree, create_chunks};
use meshstore::errors::MeshError;
use meshstore::model::Record;
use meshstore::store::{LocalStore, MemoryBackend};
use meshstore::sync::{NoticeLevel, StorageMode, SyncPhase};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn first_sync_pulls_everything_into_empty_store() {
    init_test_logging();
    let authority = authority_with(0..25);
    let node = node(config("node-a", 1_000), &authority);

    let dataset = node.channel.sync(COUNTRY).await.unwrap();
    assert_eq!(dataset.record_count(), 25);
    assert_eq!(dataset.threads.len(), 25);

    let stored = node.store.load_data(COUNTRY).await.unwrap();
    assert_eq!(stored, dataset);
    assert_eq!(node.channel.storage_mode(COUNTRY).await.unwrap(), StorageMode::Full);

    let cursor = node
        .store
        .load_metadata::<u64>(&format!("last_sync_{}", COUNTRY))
        .await
        .unwrap();
    assert_eq!(cursor, Some(dataset.last_update));
    assert_eq!(node.observer.changes.lock().as_slice(), &[(COUNTRY.to_string(), 25)]);
}

#[tokio::test]
async fn duplicate_submission_collapses() {
    let authority = authority_with(0..3);
    let node = node(config("node-a", 1_000), &authority);
    node.channel.sync(COUNTRY).await.unwrap();

    assert!(node.channel.submit_record(COUNTRY, person(100)).await.unwrap());
    assert!(!node.channel.submit_record(COUNTRY, person(100)).await.unwrap());

    // same person, new id, different casing
    let mut twin = person(100);
    twin.id = "rec-twin".to_string();
    twin.fields.insert("nombres".to_string(), "NOMBRE 100 ".into());
    assert!(!node.channel.submit_record(COUNTRY, twin).await.unwrap());

    let dataset = node.channel.sync(COUNTRY).await.unwrap();
    assert_eq!(dataset.record_count(), 4);
    assert_eq!(authority.dataset(COUNTRY).record_count(), 4);
    assert!(authority.dataset(COUNTRY).contains_record("rec-00100"));
}

#[tokio::test]
async fn server_regression_keeps_local_records() {
    let authority = authority_with(0..500);
    let node = node(config("node-a", 10_000), &authority);
    assert_eq!(node.channel.sync(COUNTRY).await.unwrap().record_count(), 500);

    // authority lost 20% and ignores what clients push
    authority.replace(COUNTRY, dataset(0..400));
    authority.set_accept_uploads(false);
    authority.seed(COUNTRY, dataset(1000..1005));

    let merged = node.channel.sync(COUNTRY).await.unwrap();
    assert_eq!(merged.record_count(), 505);
    assert!(merged.contains_record("rec-00499"));
    assert!(merged.contains_record("rec-01004"));
    assert_eq!(node.store.load_data(COUNTRY).await.unwrap().record_count(), 505);

    assert_eq!(node.channel.metrics().loss_guard_merges, 1);
    let warnings = node.observer.notices_at(NoticeLevel::Warning);
    assert!(warnings.iter().any(|n| n.message.contains("keeping local data")));
}

#[tokio::test]
async fn small_loss_follows_the_server() {
    let authority = authority_with(0..100);
    let node = node(config("node-a", 10_000), &authority);
    node.channel.sync(COUNTRY).await.unwrap();

    // 5% drop stays under the loss threshold; local-only records are re-queued
    authority.replace(COUNTRY, dataset(0..95));
    authority.set_accept_uploads(false);
    let merged = node.channel.sync(COUNTRY).await.unwrap();
    assert_eq!(merged.record_count(), 100);
    assert_eq!(node.channel.metrics().loss_guard_merges, 0);
}

#[tokio::test]
async fn large_dataset_is_chunked_reproducibly() {
    let authority = authority_with(0..3_000);
    let node = node(config("node-a", 1_000), &authority);

    let dataset = node.channel.sync(COUNTRY).await.unwrap();
    assert_eq!(dataset.record_count(), 3_000);
    assert_eq!(node.channel.storage_mode(COUNTRY).await.unwrap(), StorageMode::Distributed);

    let store = &node.store;
    let total = store
        .load_metadata::<usize>(&format!("total_chunks_{}", COUNTRY))
        .await
        .unwrap();
    assert_eq!(total, Some(60));
    assert_eq!(
        store.load_metadata::<usize>(&format!("total_records_{}", COUNTRY)).await.unwrap(),
        Some(3_000)
    );

    let held = store.list_chunk_ids(COUNTRY).await.unwrap();
    assert!(!held.is_empty() && held.len() <= meshstore::config::ChunkingConfig::default().max_local_chunks);
    let my_chunks = store
        .load_metadata::<Vec<String>>(&format!("my_chunks_{}", COUNTRY))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(my_chunks.iter().cloned().collect::<std::collections::BTreeSet<_>>(), held);

    let expected_root = build_merkle_tree(&create_chunks(&authority.dataset(COUNTRY).records, 50).unwrap());
    let root = store
        .load_metadata::<Option<String>>(&format!("merkle_root_{}", COUNTRY))
        .await
        .unwrap()
        .flatten();
    assert!(root.is_some());
    assert_eq!(root, expected_root);

    // a second round reproduces the same root and assignment
    node.channel.sync(COUNTRY).await.unwrap();
    let again = store
        .load_metadata::<Option<String>>(&format!("merkle_root_{}", COUNTRY))
        .await
        .unwrap()
        .flatten();
    assert_eq!(again, root);
    assert_eq!(store.list_chunk_ids(COUNTRY).await.unwrap(), held);

    // the shell keeps threads for every record but no confirmed records
    let shell = store.load_data(COUNTRY).await.unwrap();
    assert_eq!(shell.record_count(), 0);
    assert_eq!(shell.threads.len(), 3_000);
}

#[tokio::test]
async fn concurrent_syncs_are_coalesced() {
    let authority = authority_with(0..10);
    authority.set_latency(Duration::from_millis(150));
    let node = node(config("node-a", 1_000), &authority);

    let (a, b) = tokio::join!(node.channel.sync(COUNTRY), node.channel.sync(COUNTRY));
    assert_eq!(a.unwrap(), b.unwrap());
    assert_eq!(authority.sync_calls(), 1);
    assert_eq!(node.channel.metrics().coalesced_syncs, 1);

    // later calls are fresh rounds
    node.channel.sync(COUNTRY).await.unwrap();
    assert_eq!(authority.sync_calls(), 2);
}

#[tokio::test]
async fn offline_failure_leaves_store_untouched() {
    let authority = authority_with(0..10);
    let node = node(config("node-a", 1_000), &authority);
    node.channel.sync(COUNTRY).await.unwrap();
    let before = node.store.load_data(COUNTRY).await.unwrap();
    let cursor_before = node
        .store
        .load_metadata_entry(&format!("last_sync_{}", COUNTRY))
        .await
        .unwrap();

    authority.set_online(false);
    authority.seed(COUNTRY, dataset(10..20));
    let err = node.channel.sync(COUNTRY).await.unwrap_err();
    assert!(matches!(err, MeshError::Network(_)));
    assert!(meshstore::errors::utils::is_recoverable_error(&err));

    assert_eq!(node.store.load_data(COUNTRY).await.unwrap(), before);
    assert_eq!(
        node.store
            .load_metadata_entry(&format!("last_sync_{}", COUNTRY))
            .await
            .unwrap(),
        cursor_before
    );
    assert_eq!(node.channel.status(COUNTRY), SyncPhase::Idle);
    assert_eq!(node.observer.notices_at(NoticeLevel::Error).len(), 1);
    assert_eq!(node.channel.metrics().failed_syncs, 1);

    // retried on the next trigger
    authority.set_online(true);
    assert_eq!(node.channel.sync(COUNTRY).await.unwrap().record_count(), 20);
}

#[tokio::test]
async fn slow_authority_times_out() {
    let authority = authority_with(0..3);
    authority.set_latency(Duration::from_millis(500));
    let mut config = config("node-a", 1_000);
    config.sync.request_timeout_ms = 50;
    let node = node(config, &authority);

    let err = node.channel.sync(COUNTRY).await.unwrap_err();
    assert!(matches!(
        err,
        MeshError::Network(meshstore::errors::NetworkError::RequestTimeout { timeout_ms: 50, .. })
    ));
    assert_eq!(node.store.load_data(COUNTRY).await.unwrap().record_count(), 0);
}

#[tokio::test]
async fn degraded_primary_warns_but_syncs() {
    let authority = authority_with(0..5);
    let config = config("node-a", 1_000);
    let primary = Arc::new(MemoryBackend::new("primary", 1024 * 1024));
    primary.set_available(false);
    let store = Arc::new(LocalStore::with_primary(config.storage.clone(), primary.clone()));
    let node = node_with_store(config, store, &authority, None);

    let dataset = node.channel.sync(COUNTRY).await.unwrap();
    assert_eq!(dataset.record_count(), 5);
    assert_eq!(node.store.load_data(COUNTRY).await.unwrap().record_count(), 5);

    let warnings = node.observer.notices_at(NoticeLevel::Warning);
    assert!(warnings.iter().any(|n| n.message.contains("temporary storage")));

    primary.set_available(true);
    assert!(node.store.migrate_fallback().await.unwrap() > 0);
}

#[tokio::test]
async fn announce_runs_in_background() {
    let authority = authority_with(0..5);
    let mut config = config("node-announcer", 1_000);
    config.sync.announce = true;
    let node = node(config, &authority);
    node.channel.sync(COUNTRY).await.unwrap();

    let deadline = tokio::time::Instant::now() + test_timeout();
    while authority.announcements().is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "announce never arrived");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let announcement = &authority.announcements()[0];
    assert_eq!(announcement.node_id, "node-announcer");
    assert_eq!(announcement.record_count, 5);
    assert!(announcement.chunk_ids.is_empty());
}

#[tokio::test]
async fn periodic_sync_picks_up_new_records() {
    let authority = authority_with(0..2);
    let node = node(config("node-a", 1_000), &authority);
    let handle = node.channel.spawn_periodic(COUNTRY, Duration::from_millis(20));

    authority.seed(COUNTRY, dataset(2..4));
    let deadline = tokio::time::Instant::now() + test_timeout();
    loop {
        let dataset = node.channel.load(COUNTRY).await.unwrap();
        if dataset.record_count() == 4 {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "periodic sync stalled");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    handle.abort();
}

#[tokio::test]
async fn malformed_records_survive_a_round_trip() {
    let authority = authority_with(0..1);
    let node = node(config("node-a", 1_000), &authority);
    let raw: Record = serde_json::from_value(serde_json::json!({
        "id": "rec-raw",
        "nombres": "Sin",
        "apellidos": "Fecha",
        "pruebas": ["foto.png"],
        "editableFields": null
    }))
    .unwrap();
    assert!(node.channel.submit_record(COUNTRY, raw).await.unwrap());

    let dataset = node.channel.sync(COUNTRY).await.unwrap();
    let record = dataset.record("rec-raw").unwrap();
    assert_eq!(record.created_at, 0);
    assert_eq!(record.field("pruebas"), Some(&serde_json::json!(["foto.png"])));
}
