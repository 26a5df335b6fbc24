use std::time::Duration;

use warren_engine::Event;
use warren_store::memory::StoreCall;
use warren_tests::harness::{TestPeer, befriend, group_of, init_tracing, post_in, wait_until};
use warren_transport::memory::MemoryNet;

const CIRCUIT_DELAY: Duration = Duration::from_millis(50);

#[tokio::test(start_paused = true)]
async fn initial_sync_pulls_groups_after_circuit() {
    init_tracing();
    let net = MemoryNet::new();
    let alice = TestPeer::new(&net, "alice", CIRCUIT_DELAY);
    let bob = TestPeer::new(&net, "bob", CIRCUIT_DELAY);
    befriend(&alice, &bob);

    alice
        .store
        .add_self_group(group_of("g1", &["alice", "bob"]));

    alice.engine.start().await.unwrap();
    bob.engine.start().await.unwrap();

    assert!(
        wait_until(Duration::from_secs(5), || bob.store.has_group("g1")).await,
        "bob never pulled alice's group"
    );
}

#[tokio::test(start_paused = true)]
async fn rapid_posts_are_pushed_in_order() {
    init_tracing();
    let net = MemoryNet::new();
    let alice = TestPeer::new(&net, "alice", CIRCUIT_DELAY);
    let bob = TestPeer::new(&net, "bob", CIRCUIT_DELAY);
    befriend(&alice, &bob);

    alice
        .store
        .add_self_group(group_of("g1", &["alice", "bob"]));

    alice.engine.start().await.unwrap();
    bob.engine.start().await.unwrap();
    assert!(wait_until(Duration::from_secs(5), || bob.store.has_group("g1")).await);

    // Three posts in rapid succession, before the push task drains.
    for id in ["p1", "p2", "p3"] {
        alice.store.add_self_post(post_in("g1", id));
        alice.post_event(Event::UpdatedSelfPost {
            post_id: id.to_string(),
        });
    }

    assert!(
        wait_until(Duration::from_secs(5), || {
            ["p1", "p2", "p3"].iter().all(|id| bob.store.has_post(id))
        })
        .await,
        "posts never reached bob"
    );

    // Delivery was confirmed per post, in enqueue order.
    let confirmed: Vec<String> = alice
        .store
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            StoreCall::ConfirmItemSent { friend_id, item_id } if friend_id == bob.id() => {
                Some(item_id)
            }
            _ => None,
        })
        .collect();
    assert_eq!(confirmed, ["p1", "p2", "p3"]);
}

#[tokio::test(start_paused = true)]
async fn group_update_is_pushed_to_members() {
    init_tracing();
    let net = MemoryNet::new();
    let alice = TestPeer::new(&net, "alice", CIRCUIT_DELAY);
    let bob = TestPeer::new(&net, "bob", CIRCUIT_DELAY);
    befriend(&alice, &bob);

    alice.engine.start().await.unwrap();
    bob.engine.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    // A group authored after the initial sync arrives by push.
    let group = alice
        .store
        .add_self_group(group_of("g2", &["alice", "bob"]));
    alice.post_event(Event::UpdatedSelfGroup { group_id: group.id });

    assert!(
        wait_until(Duration::from_secs(5), || bob.store.has_group("g2")).await,
        "group push never reached bob"
    );
}
