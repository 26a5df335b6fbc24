//! Per-friend task bodies and the shared context they run against.
//!
//! A task is just `(kind, friend)`; its behavior is one match below. Every
//! body shares the same preamble (abort silently when the circuit is down or
//! the friend is gone) and epilogue (always clear the slot).

use std::sync::{Arc, Mutex};

use chrono::{Datelike, Local};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use warren_protocol::stream::{CodecError, PayloadReader, encode_payloads};
use warren_protocol::validation::{ValidationError, validate_group, validate_post};
use warren_protocol::{ByteRange, FriendId, Payload, paths};
use warren_store::blobs::BlobDirectory;
use warren_store::{DownloadState, Friend, Store, StoreError, SyncItem};
use warren_transport::{ClientPool, Method, TransportError};

use crate::pool::WorkerPool;
use crate::prefs::{self, Preferences};
use crate::providers::NetworkMonitor;
use crate::state::{SharedState, TaskKind};

#[derive(Debug, Error)]
pub(crate) enum TaskError {
    #[error("store: {0}")]
    Store(#[from] StoreError),

    #[error("transport: {0}")]
    Transport(#[from] TransportError),

    #[error("stream: {0}")]
    Codec(#[from] CodecError),

    #[error("validation: {0}")]
    Validation(#[from] ValidationError),

    #[error("encode: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything a task body needs for one engine session. Replaced wholesale
/// on restart.
pub(crate) struct TaskContext {
    pub store: Arc<dyn Store>,
    pub blobs: Arc<BlobDirectory>,
    pub state: Arc<SharedState>,
    pub prefs: Arc<dyn Preferences>,
    pub network: Arc<dyn NetworkMonitor>,
    pub local_pool: Arc<WorkerPool>,
    client_pool: Mutex<Option<ClientPool>>,
}

impl TaskContext {
    pub fn new(
        store: Arc<dyn Store>,
        blobs: Arc<BlobDirectory>,
        state: Arc<SharedState>,
        prefs: Arc<dyn Preferences>,
        network: Arc<dyn NetworkMonitor>,
        local_pool: Arc<WorkerPool>,
    ) -> Self {
        Self {
            store,
            blobs,
            state,
            prefs,
            network,
            local_pool,
            client_pool: Mutex::new(None),
        }
    }

    pub fn set_client_pool(&self, pool: ClientPool) {
        *self.client_pool.lock().unwrap_or_else(|e| e.into_inner()) = Some(pool);
    }

    pub fn take_client_pool(&self) -> Option<ClientPool> {
        self.client_pool
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    fn client_pool(&self) -> Option<ClientPool> {
        self.client_pool
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Schedule one task per (kind, friend): a no-op while the slot is
    /// occupied; otherwise the body is submitted to the local-work pool.
    pub fn trigger(self: &Arc<Self>, kind: TaskKind, friend_id: &FriendId) {
        if self.local_pool.is_shutdown() {
            return;
        }
        let ctx = Arc::clone(self);
        let task_friend = friend_id.clone();
        self.state.occupy(kind, friend_id, move || {
            let pool = Arc::clone(&ctx.local_pool);
            let task = FriendTask {
                kind,
                friend_id: task_friend,
            };
            pool.spawn(task.run(ctx))
        });
    }

    /// Time-of-day location sharing policy at the current local time.
    pub fn currently_sharing_location(&self) -> bool {
        let now = Local::now();
        prefs::sharing_allowed_at(self.prefs.as_ref(), now.weekday(), now.time())
    }
}

pub(crate) struct FriendTask {
    pub kind: TaskKind,
    pub friend_id: FriendId,
}

/// How a task body exited. `Released` means the body already cleared its
/// slot (the PushTo drain does this atomically with the empty-queue check);
/// completing again could clear a successor task's slot.
enum TaskExit {
    Done,
    Released,
}

impl FriendTask {
    pub async fn run(self, ctx: Arc<TaskContext>) {
        let kind = self.kind;
        let friend_id = self.friend_id.clone();
        match self.execute(&ctx).await {
            Ok(TaskExit::Released) => {}
            Ok(TaskExit::Done) => ctx.state.complete(kind, &friend_id),
            Err(e) => {
                match ctx.store.friend_by_id(&friend_id).await {
                    Ok(friend) => {
                        tracing::warn!(task = %kind, friend = %friend.nickname(), err = %e, "friend task failed")
                    }
                    Err(_) => tracing::warn!(task = %kind, err = %e, "friend task failed"),
                }
                ctx.state.complete(kind, &friend_id);
            }
        }
    }

    async fn execute(&self, ctx: &Arc<TaskContext>) -> Result<TaskExit, TaskError> {
        if !ctx.state.circuit_established() {
            return Ok(TaskExit::Done);
        }
        let Some(pool) = ctx.client_pool() else {
            return Ok(TaskExit::Done);
        };
        let friend = match ctx.store.friend_by_id(&self.friend_id).await {
            Ok(friend) => friend,
            // Friend deleted while the task was queued; the RemovedFriend
            // restart clears the schedule.
            Err(StoreError::NotFound) => return Ok(TaskExit::Done),
            Err(e) => return Err(e.into()),
        };
        match self.kind {
            TaskKind::AskPull => self.ask(ctx, &pool, &friend, paths::ASK_PULL_PATH).await,
            TaskKind::AskLocation => self.ask(ctx, &pool, &friend, paths::ASK_LOCATION_PATH).await,
            TaskKind::PushTo => self.push_to(ctx, &pool, &friend).await,
            TaskKind::PullFrom => self.pull_from(ctx, &pool, &friend).await,
            TaskKind::DownloadFrom => self.download_from(ctx, &pool, &friend).await,
        }
    }

    /// AskPull and AskLocation: a bare GET nudge, no body either way.
    async fn ask(
        &self,
        _ctx: &Arc<TaskContext>,
        pool: &ClientPool,
        friend: &Friend,
        path: &'static str,
    ) -> Result<TaskExit, TaskError> {
        tracing::info!(task = %self.kind, friend = %friend.nickname(), "ask");
        pool.request(
            &friend.public_identity.hidden_service_hostname,
            paths::SERVER_VIRTUAL_PORT,
            Method::Get,
            path,
        )
        .send()
        .await?;
        Ok(TaskExit::Done)
    }

    /// Drain the friend's push queue, one PUT per payload, confirming
    /// delivered groups and posts so their per-recipient cursors advance.
    async fn push_to(
        &self,
        ctx: &Arc<TaskContext>,
        pool: &ClientPool,
        friend: &Friend,
    ) -> Result<TaskExit, TaskError> {
        loop {
            // Empty queue clears the slot in the same critical section, so a
            // concurrent enqueue either lands before this check (and is
            // drained here) or finds the slot free and triggers anew.
            let Some(payload) = ctx.state.dequeue_or_complete(&self.friend_id) else {
                return Ok(TaskExit::Released);
            };
            tracing::info!(friend = %friend.nickname(), "push");
            let body = encode_payloads([&payload])?;
            pool.request(
                &friend.public_identity.hidden_service_hostname,
                paths::SERVER_VIRTUAL_PORT,
                Method::Put,
                paths::PUSH_PATH,
            )
            .body(body)
            .send()
            .await?;
            match payload {
                Payload::Group(group) => {
                    ctx.store
                        .confirm_item_sent(&self.friend_id, &SyncItem::Group(group))
                        .await?;
                }
                Payload::Post(post) => {
                    ctx.store
                        .confirm_item_sent(&self.friend_id, &SyncItem::Post(post))
                        .await?;
                }
                Payload::Location(_) => {}
            }
        }
    }

    /// Two-phase pull. The first request carries the reciprocal flag and
    /// fetches data; the second acknowledges receipt through the advanced
    /// cursor and may collect late items.
    async fn pull_from(
        &self,
        ctx: &Arc<TaskContext>,
        pool: &ClientPool,
        friend: &Friend,
    ) -> Result<TaskExit, TaskError> {
        tracing::info!(friend = %friend.nickname(), "pull");
        let max_per_transaction = ctx.store.max_pull_transaction_objects().max(1);
        for phase in 0..2 {
            let mut request = ctx.store.pull_request(&self.friend_id).await?;
            request.want_reciprocal = phase == 0;

            let response = pool
                .request(
                    &friend.public_identity.hidden_service_hostname,
                    paths::SERVER_VIRTUAL_PORT,
                    Method::Put,
                    paths::PULL_PATH,
                )
                .body(serde_json::to_vec(&request)?)
                .send()
                .await?;

            // Commit in bounded transactions. Only the first commit carries
            // the request, so its acknowledgment is applied exactly once.
            let mut pending_request = Some(request);
            let mut groups = Vec::new();
            let mut posts = Vec::new();
            let mut reader = PayloadReader::new(response.body);
            while let Some(payload) = reader.next().await? {
                match payload {
                    Payload::Group(group) => {
                        validate_group(&group)?;
                        groups.push(group);
                    }
                    Payload::Post(post) => {
                        validate_post(&post)?;
                        posts.push(post);
                    }
                    Payload::Location(_) => {
                        tracing::debug!(friend = %friend.nickname(), "ignoring location in pull response");
                    }
                }
                if groups.len() + posts.len() >= max_per_transaction {
                    ctx.store
                        .put_pull_response(
                            &self.friend_id,
                            pending_request.as_ref(),
                            &groups,
                            &posts,
                        )
                        .await?;
                    pending_request = None;
                    groups.clear();
                    posts.clear();
                }
            }
            ctx.store
                .put_pull_response(&self.friend_id, pending_request.as_ref(), &groups, &posts)
                .await?;
        }
        Ok(TaskExit::Done)
    }

    /// Resume pending downloads: ranged GET appended to the partial file,
    /// then mark complete. A file already at full size skips the fetch (the
    /// completion bit was lost, not the bytes).
    async fn download_from(
        &self,
        ctx: &Arc<TaskContext>,
        pool: &ClientPool,
        friend: &Friend,
    ) -> Result<TaskExit, TaskError> {
        if ctx.prefs.get_bool(prefs::PREF_EXCHANGE_FILES_WIFI_ONLY) && !ctx.network.is_on_wifi() {
            // The periodic retry tick picks this up once the link changes.
            return Ok(TaskExit::Done);
        }
        loop {
            let Some(download) = ctx.store.next_in_progress_download(&self.friend_id).await?
            else {
                return Ok(TaskExit::Done);
            };
            let on_disk = ctx
                .blobs
                .downloaded_size(&self.friend_id, &download.resource_id)
                .await?;
            if on_disk != download.size {
                tracing::info!(
                    friend = %friend.nickname(),
                    resource = %download.resource_id,
                    offset = on_disk,
                    "download"
                );
                let response = pool
                    .request(
                        &friend.public_identity.hidden_service_hostname,
                        paths::SERVER_VIRTUAL_PORT,
                        Method::Get,
                        paths::DOWNLOAD_PATH,
                    )
                    .query(paths::DOWNLOAD_RESOURCE_ID_PARAM, &download.resource_id)
                    .range(ByteRange::from_offset(on_disk))
                    .send()
                    .await?;
                let mut file = ctx
                    .blobs
                    .open_download_for_append(&self.friend_id, &download.resource_id)
                    .await?;
                let mut body = response.body;
                tokio::io::copy(&mut body, &mut file).await?;
                file.flush().await?;
            }
            ctx.store
                .update_download_state(
                    &self.friend_id,
                    &download.resource_id,
                    DownloadState::Complete,
                )
                .await?;
        }
    }
}
