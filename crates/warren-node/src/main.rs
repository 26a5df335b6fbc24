use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use warren_engine::prefs::MemoryPreferences;
use warren_engine::providers::{FixedNetwork, StaticLocationSource};
use warren_engine::{Engine, EngineConfig, EngineDeps};
use warren_store::blobs::BlobDirectory;
use warren_store::memory::MemoryStore;
use warren_store::SelfIdentity;
use warren_protocol::{FriendId, PublicIdentity};
use warren_transport::memory::MemoryNet;

#[derive(Parser, Debug)]
#[command(author, version, about = "warren node daemon")]
struct Args {
    /// State directory for attachment blobs.
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Nickname published to friends.
    #[arg(long, default_value = "warren")]
    nickname: String,

    /// Hidden-service hostname to publish. Defaults to "<nickname>.onion".
    #[arg(long)]
    hostname: Option<String>,

    /// Loopback circuit establishment delay in milliseconds.
    #[arg(long, default_value_t = 2_000)]
    circuit_delay_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warren=info".into()),
        )
        .init();

    let args = Args::parse();

    let state_dir = args
        .state_dir
        .unwrap_or_else(|| std::env::temp_dir().join("warren"));
    std::fs::create_dir_all(&state_dir)
        .with_context(|| format!("failed to create {}", state_dir.display()))?;

    let hostname = args
        .hostname
        .unwrap_or_else(|| format!("{}.onion", args.nickname));

    // Dev wiring: in-memory store and in-process loopback transport. A real
    // deployment provides durable-store and Tor/TLS implementations of the
    // same contracts.
    let store = Arc::new(MemoryStore::new());
    store.set_self(SelfIdentity {
        public_identity: PublicIdentity {
            id: FriendId::new(args.nickname.clone()),
            nickname: args.nickname.clone(),
            x509_certificate: format!("cert-{}", args.nickname),
            hidden_service_hostname: hostname.clone(),
            hidden_service_auth_cookie: format!("cookie-{}", args.nickname),
        },
        x509_private_key: format!("x509-key-{}", args.nickname),
        hidden_service_private_key: format!("hs-key-{}", args.nickname),
    });

    let prefs = Arc::new(MemoryPreferences::new());
    let location = Arc::new(StaticLocationSource::new());
    let network = Arc::new(FixedNetwork::wifi());
    let net = MemoryNet::new();

    let engine = Engine::new(
        EngineConfig::default(),
        EngineDeps {
            store: store.clone(),
            blobs: Arc::new(BlobDirectory::new(state_dir.join("blobs"))),
            prefs: prefs.clone(),
            location: location.clone(),
            network,
            server_factory: net.server_factory(hostname),
            onion_factory: MemoryNet::onion_factory(Duration::from_millis(args.circuit_delay_ms)),
            client_factory: net.client_factory(format!("cert-{}", args.nickname)),
        },
    );
    prefs.bind(engine.handle());
    location.bind(engine.handle());

    engine.start().await.context("failed to start engine")?;
    tracing::info!(nickname = %args.nickname, "warren node up (loopback transport)");

    tokio::signal::ctrl_c().await?;
    tracing::info!("received SIGINT, shutting down");
    engine.stop().await;
    tracing::info!("warren node shut down");
    Ok(())
}
