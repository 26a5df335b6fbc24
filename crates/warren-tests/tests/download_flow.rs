use std::time::Duration;

use tokio::io::AsyncWriteExt;
use warren_engine::Event;
use warren_store::{Download, DownloadState, LocalResource};
use warren_tests::harness::{TestPeer, befriend, init_tracing, wait_until};
use warren_transport::memory::MemoryNet;

const CIRCUIT_DELAY: Duration = Duration::from_millis(50);

fn resource_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn download(alice: &TestPeer, resource_id: &str, size: u64) -> Download {
    Download {
        friend_id: alice.id(),
        resource_id: resource_id.to_string(),
        mime_type: "application/octet-stream".to_string(),
        size,
        state: DownloadState::InProgress,
    }
}

/// Publish `bytes` as a resource alice serves to bob.
fn serve_resource(alice: &TestPeer, bob: &TestPeer, resource_id: &str, bytes: &[u8]) {
    let path = alice.blobs.root().join(format!("{resource_id}.bin"));
    std::fs::write(&path, bytes).unwrap();
    alice.store.add_local_resource(
        bob.id(),
        LocalResource {
            resource_id: resource_id.to_string(),
            mime_type: "application/octet-stream".to_string(),
            path,
            size: bytes.len() as u64,
        },
    );
}

#[tokio::test(start_paused = true)]
async fn download_resumes_from_partial_file() {
    init_tracing();
    let net = MemoryNet::new();
    let alice = TestPeer::new(&net, "alice", CIRCUIT_DELAY);
    let bob = TestPeer::new(&net, "bob", CIRCUIT_DELAY);
    befriend(&alice, &bob);

    let bytes = resource_bytes(1000);
    serve_resource(&alice, &bob, "r1", &bytes);
    bob.store.add_download(download(&alice, "r1", 1000));

    // 600 bytes already on disk from an interrupted earlier attempt.
    {
        let mut file = bob
            .blobs
            .open_download_for_append(&alice.id(), "r1")
            .await
            .unwrap();
        file.write_all(&bytes[..600]).await.unwrap();
        file.flush().await.unwrap();
    }

    alice.engine.start().await.unwrap();
    bob.engine.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    bob.post_event(Event::AddedDownload {
        friend_id: alice.id(),
    });

    assert!(
        wait_until(Duration::from_secs(5), || {
            bob.store.download_states(&alice.id()) == vec![("r1".to_string(), DownloadState::Complete)]
        })
        .await,
        "download never completed"
    );

    let stored = std::fs::read(
        bob.blobs
            .root()
            .join("downloads")
            .join("alice")
            .join("r1"),
    )
    .unwrap();
    assert_eq!(stored, bytes, "resumed file differs from the source");
}

#[tokio::test(start_paused = true)]
async fn fully_downloaded_file_skips_the_fetch() {
    init_tracing();
    let net = MemoryNet::new();
    let alice = TestPeer::new(&net, "alice", CIRCUIT_DELAY);
    let bob = TestPeer::new(&net, "bob", CIRCUIT_DELAY);
    befriend(&alice, &bob);

    // All bytes on disk, but the completion bit was lost. Alice does not
    // serve the resource, so any fetch attempt would fail and leave the
    // download in progress.
    let bytes = resource_bytes(600);
    bob.store.add_download(download(&alice, "r2", 600));
    {
        let mut file = bob
            .blobs
            .open_download_for_append(&alice.id(), "r2")
            .await
            .unwrap();
        file.write_all(&bytes).await.unwrap();
        file.flush().await.unwrap();
    }

    alice.engine.start().await.unwrap();
    bob.engine.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    bob.post_event(Event::AddedDownload {
        friend_id: alice.id(),
    });

    assert!(
        wait_until(Duration::from_secs(5), || {
            bob.store.download_states(&alice.id()) == vec![("r2".to_string(), DownloadState::Complete)]
        })
        .await,
        "state never advanced to complete"
    );
}

#[tokio::test(start_paused = true)]
async fn wifi_only_preference_defers_downloads() {
    init_tracing();
    let net = MemoryNet::new();
    let alice = TestPeer::new(&net, "alice", CIRCUIT_DELAY);
    let bob = TestPeer::new(&net, "bob", CIRCUIT_DELAY);
    befriend(&alice, &bob);

    let bytes = resource_bytes(100);
    serve_resource(&alice, &bob, "r3", &bytes);
    bob.store.add_download(download(&alice, "r3", 100));

    // Preference set before start so no debounced restart interferes.
    bob.set_wifi_only(true);
    bob.network.set_wifi(false);

    alice.engine.start().await.unwrap();
    bob.engine.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    bob.post_event(Event::AddedDownload {
        friend_id: alice.id(),
    });
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert_eq!(
        bob.store.download_states(&alice.id()),
        vec![("r3".to_string(), DownloadState::InProgress)],
        "download ran despite the wifi-only gate"
    );

    // Back on wifi, the next trigger drains it.
    bob.network.set_wifi(true);
    bob.post_event(Event::AddedDownload {
        friend_id: alice.id(),
    });
    assert!(
        wait_until(Duration::from_secs(5), || {
            bob.store.download_states(&alice.id()) == vec![("r3".to_string(), DownloadState::Complete)]
        })
        .await
    );
}
