//! Sibling contexts converging over a shared bus.

use super::utils::*;
use meshstore::model::{Dataset, VoteKind};
use meshstore::sync::{ChangeOrigin, DatasetChange, TabBus, TabEnvelope, TabMessage};
use std::sync::Arc;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

fn sibling(node_id: &str, bus: &TabBus, authority: &Arc<meshstore::sync::InMemoryAuthority>) -> TestNode {
    let config = config(node_id, 1_000);
    let store = Arc::new(meshstore::LocalStore::new(config.storage.clone()));
    node_with_store(config, store, authority, Some(bus.clone()))
}

/// Next sibling change satisfying `accept`, skipping anything else
async fn wait_for(
    changes: &mut BroadcastStream<DatasetChange>,
    accept: impl Fn(&Dataset) -> bool,
) -> DatasetChange {
    tokio::time::timeout(test_timeout(), async {
        while let Some(change) = changes.next().await {
            if let Ok(change) = change {
                if change.origin == ChangeOrigin::Sibling && accept(&change.dataset) {
                    return change;
                }
            }
        }
        panic!("change stream closed");
    })
    .await
    .expect("sibling change never arrived")
}

#[tokio::test]
async fn submitted_record_reaches_the_sibling() {
    init_test_logging();
    let authority = authority_with(0..3);
    let bus = TabBus::default();
    let a = sibling("node-a", &bus, &authority);
    let b = sibling("node-b", &bus, &authority);
    b.channel.sync(COUNTRY).await.unwrap();
    let _listener = b.channel.spawn_tab_listener();

    let mut changes = b.channel.subscribe();
    assert!(a.channel.submit_record(COUNTRY, person(50)).await.unwrap());

    let change = wait_for(&mut changes, |d| d.contains_record("rec-00050")).await;
    assert_eq!(change.country, COUNTRY);
    assert_eq!(change.dataset.record_count(), 4);
    assert!(b.store.load_data(COUNTRY).await.unwrap().contains_record("rec-00050"));
}

#[tokio::test]
async fn votes_and_comments_propagate() {
    let authority = authority_with(0..3);
    let bus = TabBus::default();
    let a = sibling("node-a", &bus, &authority);
    let b = sibling("node-b", &bus, &authority);
    a.channel.sync(COUNTRY).await.unwrap();
    b.channel.sync(COUNTRY).await.unwrap();
    let _listener = b.channel.spawn_tab_listener();
    let mut changes = b.channel.subscribe();

    a.channel
        .record_vote(COUNTRY, "rec-00001", VoteKind::Approve)
        .await
        .unwrap();
    wait_for(&mut changes, |d| {
        d.threads.get("rec-00001").map_or(false, |t| t.votes.approve == 1)
    })
    .await;

    a.channel
        .add_comment(COUNTRY, "rec-00002", "ana", "visto en Lima")
        .await
        .unwrap();
    let change = wait_for(&mut changes, |d| {
        d.threads.get("rec-00002").map_or(false, |t| t.comments.len() == 1)
    })
    .await;
    assert_eq!(change.dataset.threads["rec-00002"].comments[0].text, "visto en Lima");

    let stored = b.store.load_data(COUNTRY).await.unwrap();
    assert_eq!(stored.threads["rec-00001"].votes.approve, 1);
}

#[tokio::test]
async fn sync_result_is_shared_without_a_second_round() {
    let authority = authority_with(0..10);
    let bus = TabBus::default();
    let a = sibling("node-a", &bus, &authority);
    let b = sibling("node-b", &bus, &authority);
    let _listener = b.channel.spawn_tab_listener();
    let mut changes = b.channel.subscribe();

    a.channel.sync(COUNTRY).await.unwrap();
    let change = wait_for(&mut changes, |d| d.record_count() == 10).await;
    assert_eq!(change.dataset.record_count(), 10);
    assert_eq!(authority.sync_calls(), 1);

    // sibling sync results update the view only
    assert!(b.store.load_data(COUNTRY).await.unwrap().is_empty());
    assert_eq!(b.channel.load(COUNTRY).await.unwrap().record_count(), 10);
}

#[tokio::test]
async fn request_sync_is_answered_with_the_published_dataset() {
    let authority = authority_with(0..4);
    let bus = TabBus::default();
    let a = sibling("node-a", &bus, &authority);
    a.channel.sync(COUNTRY).await.unwrap();
    let _listener = a.channel.spawn_tab_listener();

    let mut receiver = bus.subscribe();
    bus.publish(
        "fresh-context",
        TabMessage::RequestSync {
            country: COUNTRY.to_string(),
        },
    );

    let reply = tokio::time::timeout(test_timeout(), async {
        loop {
            let envelope = receiver.recv().await.unwrap();
            if envelope.origin == a.channel.context_id() {
                return envelope;
            }
        }
    })
    .await
    .unwrap();

    match reply.message {
        TabMessage::DataUpdated { country, dataset } => {
            assert_eq!(country, COUNTRY);
            assert_eq!(dataset.record_count(), 4);
        }
        other => panic!("unexpected reply: {}", other.kind()),
    }
}

#[tokio::test]
async fn own_messages_are_ignored() {
    let authority = authority_with(0..2);
    let bus = TabBus::default();
    let a = sibling("node-a", &bus, &authority);
    a.channel.sync(COUNTRY).await.unwrap();

    let echo = TabEnvelope {
        origin: a.channel.context_id().to_string(),
        timestamp: 1,
        message: TabMessage::NewRecord {
            country: COUNTRY.to_string(),
            record: person(99),
        },
    };
    assert!(!a.channel.apply_tab_message(echo).await.unwrap());
    assert!(!a.channel.load(COUNTRY).await.unwrap().contains_record("rec-00099"));
}
