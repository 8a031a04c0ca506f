//! Cursor-driven sync between two cores.
//!
//! Bob is offline while Alice writes; when Bob comes back, one sync round
//! pulls exactly the missed messages, the cursor advances to the merged
//! clock, and a second round transfers nothing.
//!
//! Run with: cargo test --test integration_sync_resume

use solconnect_core::{
    CoreConfig, MemoryConnector, MemoryRelay, MessageBus, RelayEndpoint, SelectionStrategy,
};
use std::sync::Arc;
use std::time::Duration;

fn wallet(fill: u8) -> String {
    bs58::encode([fill; 32]).into_string()
}

const SHARED_KEY: [u8; 32] = [7u8; 32];
const EPOCH: u64 = 1_000;

fn config(device: &str) -> CoreConfig {
    CoreConfig {
        device_id: device.into(),
        relay_endpoints: vec![RelayEndpoint::new("r1", "mem://r1", "local", 1)],
        selection_strategy: SelectionStrategy::RoundRobin,
        ..CoreConfig::default()
    }
}

async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..300 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn test_sync_pulls_missed_messages_then_nothing() {
    let relay = MemoryRelay::new("r1");

    let alice = MessageBus::init_with_connector(
        config("alice-dev"),
        &wallet(1),
        Arc::new(MemoryConnector::new(vec![relay.clone()])),
    )
    .unwrap();
    let bob = MessageBus::init_with_connector(
        config("bob-dev"),
        &wallet(2),
        Arc::new(MemoryConnector::new(vec![relay.clone()])),
    )
    .unwrap();

    let session_a = alice.start_session_at(&wallet(2), &SHARED_KEY, EPOCH).unwrap();
    let session_b = bob.start_session_at(&wallet(1), &SHARED_KEY, EPOCH).unwrap();
    assert_eq!(session_a.session_id, session_b.session_id);
    let session_id = session_a.session_id.clone();

    // Alice writes while Bob is offline; the relay acks her sends
    alice.connect().await.unwrap();
    for text in ["m4", "m5", "m6"] {
        alice.send(&session_id, text).await.unwrap();
    }
    let alice_store = alice.stored_messages(&session_id).unwrap();
    assert_eq!(alice_store.len(), 3);

    // Bob reconnects and asks for everything past his (empty) cursor
    bob.connect().await.unwrap();
    let stats = bob.sync(&session_id).await.unwrap();
    assert_eq!(stats.total_messages_synced, 3);

    let bob_store = bob.stored_messages(&session_id).unwrap();
    assert_eq!(bob_store.len(), 3);
    // Alice's device counters arrived intact
    let counters: Vec<u64> = bob_store
        .iter()
        .map(|m| m.vector_clock.get("alice-dev"))
        .collect();
    assert_eq!(counters, vec![1, 2, 3]);

    // A second round is a no-op
    let stats = bob.sync(&session_id).await.unwrap();
    assert_eq!(stats.total_messages_synced, 0);

    alice.disconnect().await.unwrap();
    bob.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_sync_resumes_from_partial_cursor() {
    let relay = MemoryRelay::new("r1");

    let alice = MessageBus::init_with_connector(
        config("alice-dev"),
        &wallet(1),
        Arc::new(MemoryConnector::new(vec![relay.clone()])),
    )
    .unwrap();
    let bob = MessageBus::init_with_connector(
        config("bob-dev"),
        &wallet(2),
        Arc::new(MemoryConnector::new(vec![relay.clone()])),
    )
    .unwrap();

    let session_id = alice
        .start_session_at(&wallet(2), &SHARED_KEY, EPOCH)
        .unwrap()
        .session_id;
    bob.start_session_at(&wallet(1), &SHARED_KEY, EPOCH).unwrap();

    alice.connect().await.unwrap();
    alice.send(&session_id, "first").await.unwrap();

    // Bob syncs the first message, establishing a non-empty cursor
    bob.connect().await.unwrap();
    assert_eq!(bob.sync(&session_id).await.unwrap().total_messages_synced, 1);

    // More traffic lands while Bob idles; the next round pulls only the
    // delta the cursor does not dominate
    alice.send(&session_id, "second").await.unwrap();
    alice.send(&session_id, "third").await.unwrap();
    assert!(wait_until(|| alice.stored_messages(&session_id).unwrap().len() == 3).await);

    // Bob may have already received the live-forwarded chats; syncing is
    // idempotent either way and converges both stores
    let _ = bob.sync(&session_id).await.unwrap();
    assert_eq!(bob.stored_messages(&session_id).unwrap().len(), 3);

    alice.disconnect().await.unwrap();
    bob.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_user_sync_is_rejected_not_duplicated() {
    let relay = MemoryRelay::new("r1");
    let bob = MessageBus::init_with_connector(
        config("bob-dev"),
        &wallet(2),
        Arc::new(MemoryConnector::new(vec![relay.clone()])),
    )
    .unwrap();
    bob.start_session_at(&wallet(1), &SHARED_KEY, EPOCH).unwrap();
    bob.connect().await.unwrap();

    let session_id = bob.sessions().unwrap()[0].session_id.clone();

    // Nobody serves the request (no peer online), so the first sync parks
    // until its deadline; a second user-issued sync must be refused
    let bob2 = bob.clone();
    let sid = session_id.clone();
    let first = tokio::spawn(async move { bob2.sync(&sid).await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let err = bob.sync(&session_id).await.unwrap_err();
    assert_eq!(err.code, "SYNC_IN_PROGRESS");

    first.abort();
    bob.disconnect().await.unwrap();
}
