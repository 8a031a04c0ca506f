//! End-to-end send lifecycle: two cores sharing one relay.
//!
//! Verifies the full status ladder — persisted as Queued, relay ACK moves
//! it to Sent, the peer's delivery receipt moves it to Delivered, and a
//! mark_read on the far side lands it at Read — plus causal delivery of the
//! decrypted payload to subscribers.
//!
//! Run with: cargo test --test integration_send_lifecycle

use solconnect_core::{
    CoreConfig, CoreEvent, MemoryConnector, MemoryRelay, MessageBus, MessageStatus, RelayEndpoint,
    SelectionStrategy,
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

async fn wait_for_status(bus: &Arc<MessageBus>, message_id: &str, want: MessageStatus) -> bool {
    for _ in 0..200 {
        if bus.status(message_id).ok() == Some(want) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

async fn two_peers(relay: &Arc<MemoryRelay>) -> (Arc<MessageBus>, Arc<MessageBus>) {
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

    alice.connect().await.unwrap();
    bob.connect().await.unwrap();
    (alice, bob)
}

#[tokio::test]
async fn test_happy_send_reaches_delivered() {
    let relay = MemoryRelay::new("r1");
    let (alice, bob) = two_peers(&relay).await;

    // Both sides derive the same session id from the pinned epoch
    let session_a = alice.start_session_at(&wallet(2), &SHARED_KEY, EPOCH).unwrap();
    let session_b = bob.start_session_at(&wallet(1), &SHARED_KEY, EPOCH).unwrap();
    assert_eq!(session_a.session_id, session_b.session_id);

    let mut bob_events = bob.subscribe(&session_b.session_id).unwrap();

    let receipt = alice.send(&session_a.session_id, "hello").await.unwrap();
    assert!(matches!(
        receipt.status,
        MessageStatus::Queued | MessageStatus::Sent
    ));

    // Relay ACK -> Sent, Bob's delivery receipt -> Delivered
    assert!(wait_for_status(&alice, &receipt.message_id, MessageStatus::Delivered).await);

    // Bob stored the ciphertext and his subscriber saw the plaintext
    let bob_stored = bob.stored_messages(&session_b.session_id).unwrap();
    assert_eq!(bob_stored.len(), 1);
    assert_ne!(bob_stored[0].ciphertext, b"hello");

    let mut saw_plaintext = false;
    for _ in 0..50 {
        match tokio::time::timeout(Duration::from_millis(100), bob_events.next()).await {
            Ok(Some(CoreEvent::MessageReceived { plaintext, message })) => {
                assert_eq!(message.id, receipt.message_id);
                assert_eq!(plaintext, b"hello");
                saw_plaintext = true;
                break;
            }
            Ok(Some(_)) => continue,
            _ => break,
        }
    }
    assert!(saw_plaintext, "subscriber never saw the decrypted message");

    alice.disconnect().await.unwrap();
    bob.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_peer_mark_read_completes_the_ladder() {
    let relay = MemoryRelay::new("r1");
    let (alice, bob) = two_peers(&relay).await;

    let session_a = alice.start_session_at(&wallet(2), &SHARED_KEY, EPOCH).unwrap();
    let session_b = bob.start_session_at(&wallet(1), &SHARED_KEY, EPOCH).unwrap();

    let receipt = alice.send(&session_a.session_id, "read me").await.unwrap();
    assert!(wait_for_status(&alice, &receipt.message_id, MessageStatus::Delivered).await);

    bob.mark_read(&session_b.session_id, &[receipt.message_id.clone()])
        .await
        .unwrap();

    // Bob's batch flushes after the debounce window and reaches Alice
    assert!(wait_for_status(&alice, &receipt.message_id, MessageStatus::Read).await);

    // Status never regresses afterwards
    assert_eq!(
        alice.status(&receipt.message_id).unwrap(),
        MessageStatus::Read
    );

    alice.disconnect().await.unwrap();
    bob.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_status_events_are_monotone() {
    let relay = MemoryRelay::new("r1");
    let (alice, bob) = two_peers(&relay).await;

    let session_a = alice.start_session_at(&wallet(2), &SHARED_KEY, EPOCH).unwrap();
    let session_b = bob.start_session_at(&wallet(1), &SHARED_KEY, EPOCH).unwrap();

    let mut alice_events = alice.subscribe(&session_a.session_id).unwrap();

    let receipt = alice.send(&session_a.session_id, "watch me").await.unwrap();
    assert!(wait_for_status(&alice, &receipt.message_id, MessageStatus::Delivered).await);
    bob.mark_read(&session_b.session_id, &[receipt.message_id.clone()])
        .await
        .unwrap();
    assert!(wait_for_status(&alice, &receipt.message_id, MessageStatus::Read).await);

    // Collect the observed status sequence for the message
    let mut observed = Vec::new();
    while let Ok(Some(event)) =
        tokio::time::timeout(Duration::from_millis(100), alice_events.next()).await
    {
        if let CoreEvent::StatusChanged {
            message_id, status, ..
        } = event
        {
            if message_id == receipt.message_id {
                observed.push(status);
            }
        }
    }

    assert!(!observed.is_empty());
    // Ranks strictly increase: a prefix of Queued < Sent < Delivered < Read
    for pair in observed.windows(2) {
        assert!(pair[0].rank() < pair[1].rank(), "regression in {:?}", observed);
    }

    alice.disconnect().await.unwrap();
    bob.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_messages_sent_counter_tracks_wire_sends() {
    let relay = MemoryRelay::new("r1");
    let (alice, _bob) = two_peers(&relay).await;

    let session = alice.start_session_at(&wallet(2), &SHARED_KEY, EPOCH).unwrap();
    let r1 = alice.send(&session.session_id, "one").await.unwrap();
    let r2 = alice.send(&session.session_id, "two").await.unwrap();

    assert!(wait_for_status(&alice, &r1.message_id, MessageStatus::Delivered).await);
    assert!(wait_for_status(&alice, &r2.message_id, MessageStatus::Delivered).await);

    let metrics = alice.metrics();
    assert!(metrics.messages_sent >= 2);
    assert_eq!(metrics.failover_count, 0);
    assert!(metrics.send.count >= 2);

    alice.disconnect().await.unwrap();
}
