//! Test harness: peers wired over the in-process loopback transport.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use warren_engine::prefs::{
    self, MemoryPreferences, PREF_AUTOMATIC_LOCATION_SHARING, PREF_LIMIT_LOCATION_SHARING_DAY,
};
use warren_engine::providers::{FixedNetwork, StaticLocationSource};
use warren_engine::{Engine, EngineConfig, EngineDeps, Event};
use warren_protocol::{FriendId, Group, Location, Post, PublicIdentity};
use warren_store::blobs::BlobDirectory;
use warren_store::memory::MemoryStore;
use warren_store::{Friend, SelfIdentity};
use warren_transport::memory::MemoryNet;
use warren_transport::{PeerServer, RequestHandler, ServerFactory, TlsIdentity, TransportError};

/// Initialize tracing for tests (only once per process).
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("warren_engine=debug,warren_transport=debug")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// Poll `condition` until true or the (tokio-virtual) timeout elapses.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

pub fn identity(name: &str) -> PublicIdentity {
    PublicIdentity {
        id: FriendId::new(name),
        nickname: name.to_string(),
        x509_certificate: format!("cert-{name}"),
        hidden_service_hostname: format!("{name}.onion"),
        hidden_service_auth_cookie: format!("cookie-{name}"),
    }
}

fn self_identity(name: &str) -> SelfIdentity {
    SelfIdentity {
        public_identity: identity(name),
        x509_private_key: format!("x509-key-{name}"),
        hidden_service_private_key: format!("hs-key-{name}"),
    }
}

pub fn group_of(id: &str, members: &[&str]) -> Group {
    Group {
        id: id.to_string(),
        name: format!("group {id}"),
        members: members.iter().map(|m| identity(m)).collect(),
        sequence_number: 0,
        modified_timestamp: Utc::now(),
    }
}

pub fn post_in(group_id: &str, id: &str) -> Post {
    Post {
        id: id.to_string(),
        group_id: group_id.to_string(),
        content: format!("post {id}"),
        attachments: vec![],
        sequence_number: 0,
        created_timestamp: Utc::now(),
    }
}

pub fn fix(latitude: f64, longitude: f64) -> Location {
    Location {
        timestamp: Utc::now(),
        latitude,
        longitude,
        street_address: String::new(),
    }
}

/// Counts server binds: one per engine start, so restarts are observable.
struct CountingServerFactory {
    inner: Arc<dyn ServerFactory>,
    binds: Arc<AtomicUsize>,
}

impl ServerFactory for CountingServerFactory {
    fn bind(
        &self,
        identity: TlsIdentity,
        accepted_peer_certificates: Vec<String>,
        handler: Arc<dyn RequestHandler>,
    ) -> Result<Arc<dyn PeerServer>, TransportError> {
        self.binds.fetch_add(1, Ordering::SeqCst);
        self.inner
            .bind(identity, accepted_peer_certificates, handler)
    }
}

/// One node: its store, preferences, providers, and engine.
pub struct TestPeer {
    pub name: String,
    pub store: Arc<MemoryStore>,
    pub prefs: Arc<MemoryPreferences>,
    pub location: Arc<StaticLocationSource>,
    pub network: Arc<FixedNetwork>,
    pub blobs: Arc<BlobDirectory>,
    pub engine: Engine,
    /// Server binds so far; increments on every engine (re)start.
    pub binds: Arc<AtomicUsize>,
    _blob_dir: tempfile::TempDir,
}

impl TestPeer {
    pub fn new(net: &Arc<MemoryNet>, name: &str, circuit_delay: Duration) -> Self {
        Self::with_store(
            net,
            name,
            circuit_delay,
            EngineConfig::default(),
            Arc::new(MemoryStore::new()),
        )
    }

    pub fn with_store(
        net: &Arc<MemoryNet>,
        name: &str,
        circuit_delay: Duration,
        config: EngineConfig,
        store: Arc<MemoryStore>,
    ) -> Self {
        store.set_self(self_identity(name));

        let blob_dir = tempfile::tempdir().expect("tempdir");
        let blobs = Arc::new(BlobDirectory::new(blob_dir.path()));
        let prefs = Arc::new(MemoryPreferences::new());
        let location = Arc::new(StaticLocationSource::new());
        let network = Arc::new(FixedNetwork::wifi());
        let binds = Arc::new(AtomicUsize::new(0));

        let engine = Engine::new(
            config,
            EngineDeps {
                store: store.clone(),
                blobs: Arc::clone(&blobs),
                prefs: prefs.clone(),
                location: location.clone(),
                network: network.clone(),
                server_factory: Arc::new(CountingServerFactory {
                    inner: net.server_factory(format!("{name}.onion")),
                    binds: Arc::clone(&binds),
                }),
                onion_factory: MemoryNet::onion_factory(circuit_delay),
                client_factory: net.client_factory(format!("cert-{name}")),
            },
        );
        prefs.bind(engine.handle());
        location.bind(engine.handle());

        Self {
            name: name.to_string(),
            store,
            prefs,
            location,
            network,
            blobs,
            engine,
            binds,
            _blob_dir: blob_dir,
        }
    }

    pub fn id(&self) -> FriendId {
        FriendId::new(self.name.clone())
    }

    pub fn as_friend(&self) -> Friend {
        Friend {
            public_identity: identity(&self.name),
        }
    }

    pub fn post_event(&self, event: Event) {
        self.engine.handle().post(event);
    }

    /// Allow location sharing on every weekday, no time window.
    pub fn enable_location_sharing(&self) {
        self.prefs.set_bool(PREF_AUTOMATIC_LOCATION_SHARING, true);
        self.prefs.set_string_set(
            PREF_LIMIT_LOCATION_SHARING_DAY,
            [
                "Monday", "Tuesday", "Wednesday", "Thursday", "Friday", "Saturday", "Sunday",
            ]
            .map(str::to_string),
        );
    }

    pub fn set_wifi_only(&self, wifi_only: bool) {
        self.prefs
            .set_bool(prefs::PREF_EXCHANGE_FILES_WIFI_ONLY, wifi_only);
    }
}

/// Record each peer in the other's friend list.
pub fn befriend(a: &TestPeer, b: &TestPeer) {
    a.store.add_friend(b.as_friend());
    b.store.add_friend(a.as_friend());
}
