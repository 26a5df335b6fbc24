use std::time::Duration;

use warren_tests::harness::{TestPeer, befriend, fix, init_tracing, wait_until};
use warren_transport::memory::MemoryNet;

const CIRCUIT_DELAY: Duration = Duration::from_millis(50);

#[tokio::test(start_paused = true)]
async fn location_request_round_trip() {
    init_tracing();
    let net = MemoryNet::new();
    let alice = TestPeer::new(&net, "alice", CIRCUIT_DELAY);
    let bob = TestPeer::new(&net, "bob", CIRCUIT_DELAY);
    befriend(&alice, &bob);

    // Alice shares her location and her provider has a fix ready.
    alice.enable_location_sharing();
    alice.location.set_fix(fix(45.5017, -73.5673));

    alice.engine.start().await.unwrap();
    bob.engine.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    bob.engine.ask_location_from(&alice.id()).await;

    assert!(
        wait_until(Duration::from_secs(5), || {
            bob.store.friend_location(&alice.id()).is_some()
        })
        .await,
        "alice's fix never reached bob"
    );
    let location = bob.store.friend_location(&alice.id()).unwrap();
    assert_eq!(location.latitude, 45.5017);
    assert_eq!(location.longitude, -73.5673);
}

#[tokio::test(start_paused = true)]
async fn location_request_rejected_when_not_sharing() {
    init_tracing();
    let net = MemoryNet::new();
    let alice = TestPeer::new(&net, "alice", CIRCUIT_DELAY);
    let bob = TestPeer::new(&net, "bob", CIRCUIT_DELAY);
    befriend(&alice, &bob);

    // automatic-location-sharing stays off.
    alice.location.set_fix(fix(45.5017, -73.5673));

    alice.engine.start().await.unwrap();
    bob.engine.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    bob.engine.ask_location_from(&alice.id()).await;
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert!(bob.store.friend_location(&alice.id()).is_none());
}

#[tokio::test(start_paused = true)]
async fn each_fix_goes_only_to_requesters() {
    init_tracing();
    let net = MemoryNet::new();
    let alice = TestPeer::new(&net, "alice", CIRCUIT_DELAY);
    let bob = TestPeer::new(&net, "bob", CIRCUIT_DELAY);
    let carol = TestPeer::new(&net, "carol", CIRCUIT_DELAY);
    befriend(&alice, &bob);
    befriend(&alice, &carol);

    alice.enable_location_sharing();
    alice.location.set_fix(fix(48.8566, 2.3522));

    alice.engine.start().await.unwrap();
    bob.engine.start().await.unwrap();
    carol.engine.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Only bob asks.
    bob.engine.ask_location_from(&alice.id()).await;

    assert!(
        wait_until(Duration::from_secs(5), || {
            bob.store.friend_location(&alice.id()).is_some()
        })
        .await
    );
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(carol.store.friend_location(&alice.id()).is_none());
}
