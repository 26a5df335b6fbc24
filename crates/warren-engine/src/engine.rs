//! The engine core.
//!
//! Owns the sharing lifecycle: brings up the peer server and onion router,
//! runs the event loop that serializes every reaction, schedules per-friend
//! tasks, and tears the whole session down on stop. `stop()` followed by
//! `start()` is the only restart mechanism; the watchdog and the preference
//! debounce both go through it.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use warren_protocol::Payload;
use warren_store::blobs::BlobDirectory;
use warren_store::{Store, StoreError};
use warren_transport::{
    ClientFactory, HiddenServiceAuth, HiddenServiceKeys, OnionConfig, OnionRouter,
    OnionRouterFactory, PeerServer, ServerFactory, TlsIdentity, TransportError,
};

use crate::event::{self, EngineHandle, Event};
use crate::handlers::PeerRequestHandler;
use crate::pool::WorkerPool;
use crate::prefs::Preferences;
use crate::providers::{LocationSource, NetworkMonitor};
use crate::state::{SharedState, TaskKind};
use crate::tasks::TaskContext;
use crate::timer::{TimerKey, TimerService};

pub const THREAD_POOL_SIZE: usize = 30;

/// Initial delay before the first download retry tick, compensating for peer
/// hidden-service publish latency.
pub const FRIEND_REQUEST_DELAY: Duration = Duration::from_secs(30);
pub const DOWNLOAD_RETRY_PERIOD: Duration = Duration::from_secs(10 * 60);
pub const PREF_RESTART_DELAY: Duration = Duration::from_secs(5);
pub const NOT_CONNECTED_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const NO_COMM_TIMEOUT: Duration = Duration::from_secs(120 * 60);

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

#[derive(Clone)]
pub struct EngineConfig {
    pub local_pool_size: usize,
    pub peer_pool_size: usize,
    pub friend_request_delay: Duration,
    pub download_retry_period: Duration,
    pub preference_restart_delay: Duration,
    pub not_connected_timeout: Duration,
    pub no_communication_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            local_pool_size: THREAD_POOL_SIZE,
            peer_pool_size: THREAD_POOL_SIZE,
            friend_request_delay: FRIEND_REQUEST_DELAY,
            download_retry_period: DOWNLOAD_RETRY_PERIOD,
            preference_restart_delay: PREF_RESTART_DELAY,
            not_connected_timeout: NOT_CONNECTED_TIMEOUT,
            no_communication_timeout: NO_COMM_TIMEOUT,
        }
    }
}

/// External collaborators, threaded through at construction.
pub struct EngineDeps {
    pub store: Arc<dyn Store>,
    pub blobs: Arc<BlobDirectory>,
    pub prefs: Arc<dyn Preferences>,
    pub location: Arc<dyn LocationSource>,
    pub network: Arc<dyn NetworkMonitor>,
    pub server_factory: Arc<dyn ServerFactory>,
    pub onion_factory: Arc<dyn OnionRouterFactory>,
    pub client_factory: Arc<dyn ClientFactory>,
}

#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    config: EngineConfig,
    deps: EngineDeps,
    handle: EngineHandle,
    events: tokio::sync::Mutex<mpsc::UnboundedReceiver<Event>>,
    /// Lifecycle lock: Some while started.
    session: tokio::sync::Mutex<Option<Session>>,
}

/// Everything created per start(), torn down together on stop().
struct Session {
    ctx: Arc<TaskContext>,
    peer_pool: Arc<WorkerPool>,
    timer: TimerService,
    server: Arc<dyn PeerServer>,
    onion: Arc<dyn OnionRouter>,
    loop_task: JoinHandle<()>,
    loop_token: CancellationToken,
}

/// What one event-loop iteration can reach.
struct LoopCtx {
    engine: Engine,
    ctx: Arc<TaskContext>,
    timer: TimerService,
    onion: Arc<dyn OnionRouter>,
    token: CancellationToken,
}

impl Engine {
    pub fn new(config: EngineConfig, deps: EngineDeps) -> Self {
        let (handle, events) = event::channel();
        Self {
            inner: Arc::new(EngineInner {
                config,
                deps,
                handle,
                events: tokio::sync::Mutex::new(events),
                session: tokio::sync::Mutex::new(None),
            }),
        }
    }

    /// Handle for posting events; valid across restarts.
    pub fn handle(&self) -> EngineHandle {
        self.inner.handle.clone()
    }

    pub async fn is_started(&self) -> bool {
        self.inner.session.lock().await.is_some()
    }

    /// Bring the engine up. A running engine is stopped first. On failure
    /// everything already started is torn down and the engine stays stopped.
    pub async fn start(&self) -> Result<(), EngineError> {
        let mut session_slot = self.inner.session.lock().await;
        if let Some(previous) = session_slot.take() {
            shutdown_session(previous, &self.inner.deps.location).await;
        }
        tracing::info!("engine starting");

        // Drop events posted while stopped; reactions only run between
        // start and stop.
        {
            let mut events = self.inner.events.lock().await;
            while events.try_recv().is_ok() {}
        }

        let config = &self.inner.config;
        let deps = &self.inner.deps;

        let state = Arc::new(SharedState::new());
        let local_pool = Arc::new(WorkerPool::new(config.local_pool_size));
        let peer_pool = Arc::new(WorkerPool::new(config.peer_pool_size));
        let ctx = Arc::new(TaskContext::new(
            Arc::clone(&deps.store),
            Arc::clone(&deps.blobs),
            state,
            Arc::clone(&deps.prefs),
            Arc::clone(&deps.network),
            local_pool,
        ));

        // Self identity and friend credentials drive both transports.
        let self_identity = deps.store.self_identity().await?;
        let friends = deps.store.friends().await?;

        let handler = Arc::new(PeerRequestHandler::new(
            Arc::clone(&ctx),
            Arc::clone(&peer_pool),
            Arc::clone(&deps.location),
        ));
        let server = deps.server_factory.bind(
            TlsIdentity {
                certificate: self_identity.public_identity.x509_certificate.clone(),
                private_key: self_identity.x509_private_key.clone(),
            },
            friends
                .iter()
                .map(|f| f.public_identity.x509_certificate.clone())
                .collect(),
            handler,
        )?;
        server.start().await?;

        let on_circuit = {
            let handle = self.inner.handle.clone();
            Arc::new(move || handle.post(Event::CircuitEstablished))
        };
        let onion = deps.onion_factory.create(
            OnionConfig {
                keys: HiddenServiceKeys {
                    hostname: self_identity.public_identity.hidden_service_hostname.clone(),
                    auth_cookie: self_identity
                        .public_identity
                        .hidden_service_auth_cookie
                        .clone(),
                    private_key: self_identity.hidden_service_private_key.clone(),
                },
                client_auths: friends
                    .iter()
                    .map(|f| HiddenServiceAuth {
                        hostname: f.public_identity.hidden_service_hostname.clone(),
                        auth_cookie: f.public_identity.hidden_service_auth_cookie.clone(),
                    })
                    .collect(),
                forward_port: server.listening_port(),
            },
            on_circuit,
        );
        if let Err(e) = onion.start().await {
            server.stop().await;
            return Err(e.into());
        }

        let (fired_tx, fired_rx) = mpsc::unbounded_channel();
        let timer = TimerService::start(fired_tx);
        timer.schedule(TimerKey::Watchdog, config.not_connected_timeout);

        let loop_token = CancellationToken::new();
        let loop_ctx = LoopCtx {
            engine: self.clone(),
            ctx: Arc::clone(&ctx),
            timer: timer.clone(),
            onion: Arc::clone(&onion),
            token: loop_token.clone(),
        };
        let loop_task = tokio::spawn(run_event_loop(loop_ctx, fired_rx));

        // Begin acquiring fixes; recipients only accumulate on request.
        deps.location.start();

        *session_slot = Some(Session {
            ctx,
            peer_pool,
            timer,
            server,
            onion,
            loop_task,
            loop_token,
        });
        tracing::info!("engine started");
        Ok(())
    }

    /// Tear everything down. Idempotent.
    pub async fn stop(&self) {
        let mut session_slot = self.inner.session.lock().await;
        if let Some(session) = session_slot.take() {
            shutdown_session(session, &self.inner.deps.location).await;
        }
    }

    pub async fn restart(&self) -> Result<(), EngineError> {
        self.stop().await;
        self.start().await
    }

    /// Ask `friend_id` for a location fix. No-op while stopped or when the
    /// ask is already in flight.
    pub async fn ask_location_from(&self, friend_id: &warren_protocol::FriendId) {
        if let Some(session) = &*self.inner.session.lock().await {
            session.ctx.trigger(TaskKind::AskLocation, friend_id);
        }
    }
}

async fn shutdown_session(session: Session, location: &Arc<dyn LocationSource>) {
    tracing::info!("engine stopping");
    let Session {
        ctx,
        peer_pool,
        timer,
        server,
        onion,
        loop_task,
        loop_token,
    } = session;

    location.stop();
    // Silence reactions first so nothing re-triggers mid-teardown.
    loop_token.cancel();
    let _ = loop_task.await;
    // Dropping the last handle stops the timer task (watchdog, preference
    // debounce, and download ticker with it).
    drop(timer);

    ctx.local_pool.shutdown().await;
    peer_pool.shutdown().await;

    if let Some(pool) = ctx.take_client_pool() {
        pool.shutdown().await;
    }
    onion.stop().await;
    server.stop().await;

    ctx.state.clear();
    tracing::info!("engine stopped");
}

async fn run_event_loop(lc: LoopCtx, mut fired_rx: mpsc::UnboundedReceiver<TimerKey>) {
    // Held for the life of the loop; released on cancellation so the next
    // session's loop can take over.
    let mut events = lc.engine.inner.events.lock().await;
    loop {
        tokio::select! {
            _ = lc.token.cancelled() => break,
            maybe_event = events.recv() => match maybe_event {
                Some(event) => react(&lc, event).await,
                None => break,
            },
            maybe_key = fired_rx.recv() => match maybe_key {
                Some(key) => react_to_timer(&lc, key).await,
                None => break,
            },
        }
    }
}

async fn react(lc: &LoopCtx, event: Event) {
    let config = &lc.engine.inner.config;
    match event {
        Event::CircuitEstablished => on_circuit_established(lc).await,
        Event::UpdatedSelf => {
            // New transport credentials.
            spawn_restart(lc, "self updated");
        }
        Event::AddedFriend { friend_id } => {
            // New accepted client cert and hidden-service auth entry.
            tracing::info!(friend_id = %friend_id, "friend added");
            spawn_restart(lc, "friend added");
        }
        Event::RemovedFriend { friend_id } => {
            tracing::info!(friend_id = %friend_id, "friend removed");
            spawn_restart(lc, "friend removed");
        }
        Event::UpdatedFriend { .. } => {
            // Communication observed: extend the watchdog.
            lc.timer
                .schedule(TimerKey::Watchdog, config.no_communication_timeout);
        }
        Event::UpdatedSelfGroup { group_id } => match lc.ctx.store.group(&group_id).await {
            Ok(group) => {
                let payload = Payload::Group(group.clone());
                push_to_members(lc, &group, payload).await;
            }
            Err(e) => tracing::warn!(group_id = %group_id, err = %e, "group push failed"),
        },
        Event::UpdatedSelfLocation => on_updated_self_location(lc).await,
        Event::UpdatedSelfPost { post_id } => {
            let group = match lc.ctx.store.post(&post_id).await {
                Ok(post) => match lc.ctx.store.group(&post.group_id).await {
                    Ok(group) => Some((group, post)),
                    Err(e) => {
                        tracing::warn!(post_id = %post_id, err = %e, "post push failed");
                        None
                    }
                },
                Err(e) => {
                    tracing::warn!(post_id = %post_id, err = %e, "post push failed");
                    None
                }
            };
            if let Some((group, post)) = group {
                push_to_members(lc, &group, Payload::Post(post)).await;
            }
        }
        Event::AddedDownload { friend_id } => {
            lc.ctx.trigger(TaskKind::DownloadFrom, &friend_id);
        }
        Event::NewSelfLocationFix { location } => {
            match lc.ctx.store.put_self_location(location).await {
                // The persisted location fans out through UpdatedSelfLocation.
                Ok(()) => lc.engine.inner.handle.post(Event::UpdatedSelfLocation),
                Err(e) => tracing::warn!(err = %e, "failed to store location fix"),
            }
        }
        Event::PreferenceChanged { key } => {
            // Debounce: users drag sliders; restart once input goes idle.
            tracing::debug!(key = %key, "preference changed");
            lc.timer
                .schedule(TimerKey::PreferenceRestart, config.preference_restart_delay);
        }
    }
}

async fn react_to_timer(lc: &LoopCtx, key: TimerKey) {
    let config = &lc.engine.inner.config;
    match key {
        TimerKey::Watchdog => {
            tracing::warn!("watchdog expired; restarting engine");
            spawn_restart(lc, "watchdog expired");
        }
        TimerKey::PreferenceRestart => {
            spawn_restart(lc, "preferences changed");
        }
        TimerKey::DownloadRetry => {
            match lc.ctx.store.friends().await {
                Ok(friends) => {
                    for friend in &friends {
                        lc.ctx.trigger(TaskKind::DownloadFrom, friend.id());
                    }
                }
                Err(e) => tracing::warn!(err = %e, "download retry poll failed"),
            }
            lc.timer
                .schedule(TimerKey::DownloadRetry, config.download_retry_period);
        }
    }
}

async fn on_circuit_established(lc: &LoopCtx) {
    let config = &lc.engine.inner.config;
    lc.ctx.state.set_circuit_established(true);
    lc.timer
        .schedule(TimerKey::Watchdog, config.no_communication_timeout);

    let pool = lc
        .onion
        .socks_proxy_port()
        .and_then(|port| lc.engine.inner.deps.client_factory.connect(port));
    match pool {
        Ok(pool) => lc.ctx.set_client_pool(pool),
        Err(e) => {
            tracing::warn!(err = %e, "failed to build client pool");
            return;
        }
    }

    // Ask friends to pull our changes, and pull theirs.
    match lc.ctx.store.friends().await {
        Ok(friends) => {
            for friend in &friends {
                lc.ctx.trigger(TaskKind::AskPull, friend.id());
                lc.ctx.trigger(TaskKind::PullFrom, friend.id());
            }
        }
        Err(e) => tracing::warn!(err = %e, "friend poll failed after circuit established"),
    }

    lc.timer
        .schedule(TimerKey::DownloadRetry, config.friend_request_delay);
}

async fn on_updated_self_location(lc: &LoopCtx) {
    // Only friends who asked get the fix, and only once per request.
    let recipients = lc.ctx.state.drain_location_recipients();
    if recipients.is_empty() {
        return;
    }
    let location = match lc.ctx.store.self_location().await {
        Ok(location) => location,
        Err(e) => {
            tracing::warn!(err = %e, "location push failed");
            return;
        }
    };
    for friend_id in recipients {
        lc.ctx
            .state
            .enqueue_push(&friend_id, Payload::Location(location.clone()));
        lc.ctx.trigger(TaskKind::PushTo, &friend_id);
    }
}

async fn push_to_members(lc: &LoopCtx, group: &warren_protocol::Group, payload: Payload) {
    let self_id = match lc.ctx.store.self_identity().await {
        Ok(identity) => identity.public_identity.id,
        Err(e) => {
            tracing::warn!(err = %e, "group push failed");
            return;
        }
    };
    for member in &group.members {
        if member.id == self_id {
            continue;
        }
        lc.ctx.state.enqueue_push(&member.id, payload.clone());
        lc.ctx.trigger(TaskKind::PushTo, &member.id);
    }
}

fn spawn_restart(lc: &LoopCtx, reason: &'static str) {
    tracing::info!(reason, "scheduling engine restart");
    // Detached: the event loop must not await its own teardown.
    let engine = lc.engine.clone();
    tokio::spawn(async move {
        if let Err(e) = engine.restart().await {
            tracing::error!(err = %e, "engine restart failed");
        }
    });
}
