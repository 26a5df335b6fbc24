//! Incoming peer request handling.
//!
//! The transport server delegates every authenticated request here. Handlers
//! resolve the peer by client certificate and talk to the store directly;
//! they never take the engine's state lock except through `trigger`
//! re-entry, so peer traffic cannot block local progress.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use warren_protocol::stream::{PayloadBody, PayloadReader};
use warren_protocol::validation::{
    validate_group, validate_location, validate_post, validate_pull_request,
};
use warren_protocol::{ByteRange, Payload, PullRequest};
use warren_store::{Friend, StoreError};
use warren_transport::{Body, DownloadReply, HandlerError, RequestHandler};

use crate::pool::WorkerPool;
use crate::providers::LocationSource;
use crate::state::TaskKind;
use crate::tasks::TaskContext;

pub(crate) struct PeerRequestHandler {
    ctx: Arc<TaskContext>,
    peer_pool: Arc<WorkerPool>,
    location: Arc<dyn LocationSource>,
}

impl PeerRequestHandler {
    pub fn new(
        ctx: Arc<TaskContext>,
        peer_pool: Arc<WorkerPool>,
        location: Arc<dyn LocationSource>,
    ) -> Self {
        Self {
            ctx,
            peer_pool,
            location,
        }
    }

    async fn permit(&self) -> Result<tokio::sync::OwnedSemaphorePermit, HandlerError> {
        self.peer_pool
            .acquire()
            .await
            .ok_or_else(|| HandlerError::Internal("shutting down".into()))
    }

    async fn friend(&self, certificate: &str) -> Result<Friend, HandlerError> {
        match self.ctx.store.friend_by_certificate(certificate).await {
            Ok(friend) => Ok(friend),
            Err(StoreError::NotFound) => Err(HandlerError::UnknownPeer),
            Err(e) => Err(internal(e)),
        }
    }
}

fn internal(error: StoreError) -> HandlerError {
    HandlerError::Internal(error.to_string())
}

fn invalid(error: impl std::fmt::Display) -> HandlerError {
    HandlerError::Invalid(error.to_string())
}

#[async_trait]
impl RequestHandler for PeerRequestHandler {
    async fn friend_nickname(&self, certificate: &str) -> Result<String, HandlerError> {
        let friend = self.friend(certificate).await?;
        Ok(friend.nickname().to_string())
    }

    async fn update_friend_sent(
        &self,
        certificate: &str,
        at: DateTime<Utc>,
        bytes: u64,
    ) -> Result<(), HandlerError> {
        let friend = self.friend(certificate).await?;
        self.ctx
            .store
            .update_friend_sent(friend.id(), at, bytes)
            .await
            .map_err(internal)
    }

    async fn update_friend_received(
        &self,
        certificate: &str,
        at: DateTime<Utc>,
        bytes: u64,
    ) -> Result<(), HandlerError> {
        let friend = self.friend(certificate).await?;
        self.ctx
            .store
            .update_friend_received(friend.id(), at, bytes)
            .await
            .map_err(internal)
    }

    async fn handle_ask_pull(&self, certificate: &str) -> Result<(), HandlerError> {
        let _permit = self.permit().await?;
        let friend = self.friend(certificate).await?;
        self.ctx.trigger(TaskKind::PullFrom, friend.id());
        tracing::info!(friend = %friend.nickname(), "served ask-pull");
        Ok(())
    }

    async fn handle_ask_location(&self, certificate: &str) -> Result<(), HandlerError> {
        let _permit = self.permit().await?;
        let friend = self.friend(certificate).await?;
        if !self.ctx.currently_sharing_location() {
            tracing::info!(friend = %friend.nickname(), "rejected ask-location");
            return Err(HandlerError::NotAvailable);
        }
        self.ctx.state.add_location_recipient(friend.id().clone());
        // The fix lands as NewSelfLocationFix and fans out to recipients.
        self.location.start();
        tracing::info!(friend = %friend.nickname(), "served ask-location");
        Ok(())
    }

    async fn handle_push(&self, certificate: &str, body: Body) -> Result<(), HandlerError> {
        let _permit = self.permit().await?;
        let friend = self.friend(certificate).await?;

        // Friends found to need a pull are triggered after the stream is
        // fully consumed.
        let mut pull_from: HashSet<_> = HashSet::new();
        let mut reader = PayloadReader::new(body);
        loop {
            let payload = match reader.next().await {
                Ok(Some(payload)) => payload,
                Ok(None) => break,
                Err(e) => return Err(invalid(e)),
            };
            match payload {
                Payload::Group(group) => {
                    validate_group(&group).map_err(invalid)?;
                    // Self may have just been added to an existing group:
                    // pull the backlog from every member who is a friend.
                    for member in &group.members {
                        if self.ctx.store.friend_by_id(&member.id).await.is_ok() {
                            pull_from.insert(member.id.clone());
                        }
                    }
                    self.ctx
                        .store
                        .put_pushed_group(friend.id(), group)
                        .await
                        .map_err(internal)?;
                }
                Payload::Location(location) => {
                    validate_location(&location).map_err(invalid)?;
                    self.ctx
                        .store
                        .put_pushed_location(friend.id(), location)
                        .await
                        .map_err(internal)?;
                }
                Payload::Post(post) => {
                    validate_post(&post).map_err(invalid)?;
                    let newly_accepted = self
                        .ctx
                        .store
                        .put_pushed_post(friend.id(), post)
                        .await
                        .map_err(internal)?;
                    if newly_accepted {
                        pull_from.insert(friend.id().clone());
                    }
                }
            }
        }
        for friend_id in pull_from {
            self.ctx.trigger(TaskKind::PullFrom, &friend_id);
        }
        tracing::info!(friend = %friend.nickname(), "served push");
        Ok(())
    }

    async fn handle_pull(&self, certificate: &str, body: Vec<u8>) -> Result<Body, HandlerError> {
        let _permit = self.permit().await?;
        let friend = self.friend(certificate).await?;

        let request: PullRequest = serde_json::from_slice(&body).map_err(invalid)?;
        validate_pull_request(&request).map_err(invalid)?;
        self.ctx
            .store
            .confirm_pull_request(friend.id(), &request)
            .await
            .map_err(internal)?;
        let items = self
            .ctx
            .store
            .pull_response(friend.id(), &request)
            .await
            .map_err(internal)?;
        tracing::info!(friend = %friend.nickname(), "served pull");
        Ok(Box::new(PayloadBody::new(items)))
    }

    async fn handle_download(
        &self,
        certificate: &str,
        resource_id: &str,
        range: ByteRange,
    ) -> Result<DownloadReply, HandlerError> {
        let _permit = self.permit().await?;
        let friend = self.friend(certificate).await?;

        // Resolve before the availability gate: access control first.
        let resource = match self
            .ctx
            .store
            .local_resource_for_download(friend.id(), resource_id)
            .await
        {
            Ok(resource) => resource,
            Err(StoreError::NotFound) => return Err(HandlerError::NotAvailable),
            Err(e) => return Err(internal(e)),
        };
        if self
            .ctx
            .prefs
            .get_bool(crate::prefs::PREF_EXCHANGE_FILES_WIFI_ONLY)
            && !self.ctx.network.is_on_wifi()
        {
            return Ok(DownloadReply::unavailable());
        }
        let stream = self
            .ctx
            .blobs
            .open_resource(&resource, range)
            .await
            .map_err(|e| HandlerError::Internal(e.to_string()))?;
        tracing::info!(friend = %friend.nickname(), resource = %resource.resource_id, "served download");
        Ok(DownloadReply::stream(resource.mime_type, stream))
    }
}
