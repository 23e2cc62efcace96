//! Rebuilding chunked countries from local and pulled chunks.

use super::utils::*;
use meshstore::errors::{IntegrityError, MeshError};
use meshstore::sync::StorageMode;

fn merkle_key() -> String {
    format!("merkle_root_{}", COUNTRY)
}

#[tokio::test]
async fn full_mode_returns_the_stored_dataset() {
    let authority = authority_with(0..20);
    let node = node(config("node-a", 1_000), &authority);
    node.channel.sync(COUNTRY).await.unwrap();

    let rebuilt = node.channel.reconstruct(COUNTRY).await.unwrap();
    assert!(rebuilt.complete);
    assert!(!rebuilt.refreshed);
    assert_eq!(rebuilt.dataset, node.store.load_data(COUNTRY).await.unwrap());
    assert_eq!(rebuilt.pulled_chunks, 0);
}

#[tokio::test]
async fn fully_replicated_country_rebuilds_locally() {
    // 6 chunks of 50 stay under the full replication bound
    let authority = authority_with(0..300);
    let node = node(config("node-a", 100), &authority);
    node.channel.sync(COUNTRY).await.unwrap();
    assert_eq!(node.channel.storage_mode(COUNTRY).await.unwrap(), StorageMode::Distributed);
    assert_eq!(node.store.list_chunk_ids(COUNTRY).await.unwrap().len(), 6);

    authority.set_online(false);
    let rebuilt = node.channel.reconstruct(COUNTRY).await.unwrap();
    assert!(rebuilt.complete && rebuilt.verified);
    assert_eq!(rebuilt.local_chunks, 6);
    assert_eq!(rebuilt.pulled_chunks, 0);
    assert_eq!(rebuilt.dataset.record_count(), 300);
    assert_eq!(rebuilt.dataset.records[0].id, "rec-00000");
    assert_eq!(rebuilt.dataset.records[299].id, "rec-00299");
}

#[tokio::test]
async fn merkle_mismatch_triggers_a_fresh_fetch() {
    init_test_logging();
    let authority = authority_with(0..300);
    let node = node(config("node-a", 100), &authority);
    node.channel.sync(COUNTRY).await.unwrap();

    node.store
        .save_metadata(&merkle_key(), &Some("bogus".to_string()))
        .await
        .unwrap();
    let calls_before = authority.sync_calls();

    let rebuilt = node.channel.reconstruct(COUNTRY).await.unwrap();
    assert!(rebuilt.refreshed);
    assert_eq!(rebuilt.dataset.record_count(), 300);
    assert_eq!(authority.sync_calls(), calls_before + 1);

    // the refetch rewrote the root
    let again = node.channel.reconstruct(COUNTRY).await.unwrap();
    assert!(again.verified);
    assert!(!again.refreshed);
}

#[tokio::test]
async fn merkle_mismatch_without_authority_is_an_error() {
    let authority = authority_with(0..300);
    let node = node(config("node-a", 100), &authority);
    node.channel.sync(COUNTRY).await.unwrap();

    node.store
        .save_metadata(&merkle_key(), &Some("bogus".to_string()))
        .await
        .unwrap();
    authority.set_online(false);

    let err = node.channel.reconstruct(COUNTRY).await.unwrap_err();
    match err {
        MeshError::Integrity(IntegrityError::MerkleRootMismatch { expected, country, .. }) => {
            assert_eq!(expected, "bogus");
            assert_eq!(country, COUNTRY);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn missing_chunks_are_pulled_and_verified() {
    let authority = authority_with(0..3_000);
    let node = node(config("node-a", 1_000), &authority);
    node.channel.sync(COUNTRY).await.unwrap();
    let held = node.store.list_chunk_ids(COUNTRY).await.unwrap().len();

    let rebuilt = node.channel.reconstruct(COUNTRY).await.unwrap();
    assert!(rebuilt.complete);
    assert!(rebuilt.verified);
    assert_eq!(rebuilt.local_chunks, held);
    assert_eq!(rebuilt.pulled_chunks, 60 - held);
    assert_eq!(rebuilt.dataset.record_count(), 3_000);
    assert!(rebuilt.missing.is_empty());

    // pulled chunks are not kept
    assert_eq!(node.store.list_chunk_ids(COUNTRY).await.unwrap().len(), held);
}

#[tokio::test]
async fn tampered_pulls_leave_a_partial_result() {
    let authority = authority_with(0..3_000);
    let node = node(config("node-a", 1_000), &authority);
    node.channel.sync(COUNTRY).await.unwrap();
    let held = node.store.list_chunk_ids(COUNTRY).await.unwrap().len();

    authority.set_corrupt_chunks(true);
    let rebuilt = node.channel.reconstruct(COUNTRY).await.unwrap();
    assert!(!rebuilt.complete);
    assert!(!rebuilt.verified);
    assert_eq!(rebuilt.missing.len(), 60 - held);
    assert_eq!(rebuilt.pulled_chunks, 0);
    assert_eq!(rebuilt.dataset.record_count(), held * 50);
    assert!(rebuilt
        .dataset
        .records
        .iter()
        .all(|r| r.field_text("nombres") != "tampered"));
}

#[tokio::test]
async fn corrupted_local_chunk_is_replaced_by_a_pull() {
    let authority = authority_with(0..300);
    let node = node(config("node-a", 100), &authority);
    node.channel.sync(COUNTRY).await.unwrap();

    let id = node
        .store
        .list_chunk_ids(COUNTRY)
        .await
        .unwrap()
        .into_iter()
        .next()
        .unwrap();
    let mut chunk = node.store.load_chunk(COUNTRY, &id).await.unwrap().unwrap();
    chunk.records[0]
        .fields
        .insert("apellidos".to_string(), "bit rot".into());
    node.store.save_chunk(COUNTRY, &chunk).await.unwrap();

    let rebuilt = node.channel.reconstruct(COUNTRY).await.unwrap();
    assert!(rebuilt.complete && rebuilt.verified);
    assert_eq!(rebuilt.local_chunks, 5);
    assert_eq!(rebuilt.pulled_chunks, 1);
    assert!(!node.store.list_chunk_ids(COUNTRY).await.unwrap().contains(&id));
}
