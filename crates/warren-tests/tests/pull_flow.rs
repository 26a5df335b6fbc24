use std::sync::Arc;
use std::time::Duration;

use warren_engine::EngineConfig;
use warren_store::memory::{MemoryStore, StoreCall};
use warren_tests::harness::{TestPeer, befriend, group_of, init_tracing, post_in, wait_until};
use warren_transport::memory::MemoryNet;

const CIRCUIT_DELAY: Duration = Duration::from_millis(50);

#[tokio::test(start_paused = true)]
async fn pull_commits_in_bounded_transactions() {
    init_tracing();
    let net = MemoryNet::new();
    let alice = TestPeer::new(&net, "alice", CIRCUIT_DELAY);
    // Bob commits at most 5 objects per pull-response transaction.
    let bob = TestPeer::with_store(
        &net,
        "bob",
        CIRCUIT_DELAY,
        EngineConfig::default(),
        Arc::new(MemoryStore::new().with_max_pull_transaction_objects(5)),
    );
    befriend(&alice, &bob);

    // 15 items for bob: 12 groups then 3 posts.
    for i in 1..=12 {
        alice
            .store
            .add_self_group(group_of(&format!("g{i}"), &["alice", "bob"]));
    }
    for i in 1..=3 {
        alice.store.add_self_post(post_in("g1", &format!("p{i}")));
    }

    alice.engine.start().await.unwrap();
    bob.engine.start().await.unwrap();

    assert!(
        wait_until(Duration::from_secs(10), || {
            bob.store.has_group("g12") && bob.store.has_post("p3")
        })
        .await,
        "bob never finished pulling"
    );

    let commits: Vec<(bool, usize, usize)> = bob
        .store
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            StoreCall::PutPullResponse {
                friend_id,
                with_request,
                groups,
                posts,
            } if friend_id == alice.id() => Some((with_request, groups, posts)),
            _ => None,
        })
        .collect();

    // Every transaction respects the object cap.
    assert!(commits.iter().all(|(_, groups, posts)| groups + posts <= 5));
    // All 15 items were committed exactly once.
    let total_groups: usize = commits.iter().map(|(_, groups, _)| groups).sum();
    let total_posts: usize = commits.iter().map(|(_, _, posts)| posts).sum();
    assert_eq!(total_groups, 12);
    assert_eq!(total_posts, 3);
    // The first transaction carries the pull request; the following partial
    // commits of the same response pass no request, so the acknowledgment is
    // applied once.
    assert_eq!(commits[0], (true, 5, 0));
    assert_eq!(commits[1], (false, 5, 0));
    assert_eq!(commits[2], (false, 2, 3));
}

#[tokio::test(start_paused = true)]
async fn mutual_initial_sync_completes() {
    init_tracing();
    let net = MemoryNet::new();
    let alice = TestPeer::new(&net, "alice", CIRCUIT_DELAY);
    let bob = TestPeer::new(&net, "bob", CIRCUIT_DELAY);
    befriend(&alice, &bob);

    alice
        .store
        .add_self_group(group_of("g1", &["alice", "bob"]));
    bob.store.add_self_group(group_of("h1", &["alice", "bob"]));

    alice.engine.start().await.unwrap();
    bob.engine.start().await.unwrap();

    assert!(
        wait_until(Duration::from_secs(10), || {
            bob.store.has_group("g1") && alice.store.has_group("h1")
        })
        .await,
        "mutual sync never completed"
    );
}
