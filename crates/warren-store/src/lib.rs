//! The store contract the engine is built against.
//!
//! The durable data store is an external collaborator: the engine only sees
//! this trait. [`memory::MemoryStore`] is the reference implementation used
//! by the dev daemon and the test harness.

pub mod blobs;
pub mod memory;

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use warren_protocol::{FriendId, Group, Location, Payload, Post, PublicIdentity, PullRequest};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found")]
    NotFound,

    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// The local user: public identity plus the private key material the
/// transports are configured with.
#[derive(Debug, Clone)]
pub struct SelfIdentity {
    pub public_identity: PublicIdentity,
    pub x509_private_key: String,
    pub hidden_service_private_key: String,
}

/// A peer we exchange data with.
#[derive(Debug, Clone, PartialEq)]
pub struct Friend {
    pub public_identity: PublicIdentity,
}

impl Friend {
    pub fn id(&self) -> &FriendId {
        &self.public_identity.id
    }

    pub fn nickname(&self) -> &str {
        &self.public_identity.nickname
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadState {
    InProgress,
    Complete,
    Cancelled,
}

/// An attachment we are fetching from a friend.
#[derive(Debug, Clone, PartialEq)]
pub struct Download {
    pub friend_id: FriendId,
    pub resource_id: String,
    pub mime_type: String,
    /// Expected total size in bytes.
    pub size: u64,
    pub state: DownloadState,
}

/// A locally stored attachment a friend is allowed to download.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalResource {
    pub resource_id: String,
    pub mime_type: String,
    pub path: PathBuf,
    pub size: u64,
}

/// An item whose delivery to a specific friend can be confirmed, advancing
/// that friend's acknowledgment cursor.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncItem {
    Group(Group),
    Post(Post),
}

impl SyncItem {
    pub fn sequence_number(&self) -> i64 {
        match self {
            SyncItem::Group(group) => group.sequence_number,
            SyncItem::Post(post) => post.sequence_number,
        }
    }
}

/// Iterator over the payloads of a pull response. Boxed so stores can stream
/// from their own cursor types.
pub type PayloadIter = Box<dyn Iterator<Item = Payload> + Send>;

/// Typed accessors over the durable data store. Implementations are
/// externally thread-safe; every method may block on storage.
#[async_trait]
pub trait Store: Send + Sync {
    async fn self_identity(&self) -> Result<SelfIdentity, StoreError>;

    async fn friends(&self) -> Result<Vec<Friend>, StoreError>;
    async fn friend_by_id(&self, id: &FriendId) -> Result<Friend, StoreError>;
    async fn friend_by_certificate(&self, certificate: &str) -> Result<Friend, StoreError>;

    async fn group(&self, id: &str) -> Result<Group, StoreError>;
    async fn post(&self, id: &str) -> Result<Post, StoreError>;
    async fn self_location(&self) -> Result<Location, StoreError>;

    async fn put_group(&self, group: Group) -> Result<(), StoreError>;
    async fn put_self_location(&self, location: Location) -> Result<(), StoreError>;

    /// Store a group pushed to us by `friend_id`.
    async fn put_pushed_group(&self, friend_id: &FriendId, group: Group)
        -> Result<(), StoreError>;
    /// Store a location pushed to us by `friend_id`.
    async fn put_pushed_location(
        &self,
        friend_id: &FriendId,
        location: Location,
    ) -> Result<(), StoreError>;
    /// Store a post pushed to us by `friend_id`. Returns true iff the post
    /// was newly accepted.
    async fn put_pushed_post(&self, friend_id: &FriendId, post: Post) -> Result<bool, StoreError>;

    /// The cursor to send when pulling from `friend_id`.
    async fn pull_request(&self, friend_id: &FriendId) -> Result<PullRequest, StoreError>;

    /// Commit one transaction of pulled objects. `pull_request` is present on
    /// the first commit of a response only, so acknowledgments are applied
    /// once per exchange.
    async fn put_pull_response(
        &self,
        friend_id: &FriendId,
        pull_request: Option<&PullRequest>,
        groups: &[Group],
        posts: &[Post],
    ) -> Result<(), StoreError>;

    /// Record that `item` was delivered to `friend_id`.
    async fn confirm_item_sent(
        &self,
        friend_id: &FriendId,
        item: &SyncItem,
    ) -> Result<(), StoreError>;

    /// Apply the acknowledgment carried by a peer's pull request.
    async fn confirm_pull_request(
        &self,
        friend_id: &FriendId,
        pull_request: &PullRequest,
    ) -> Result<(), StoreError>;

    /// Items `friend_id` has not acknowledged, per its pull request.
    async fn pull_response(
        &self,
        friend_id: &FriendId,
        pull_request: &PullRequest,
    ) -> Result<PayloadIter, StoreError>;

    async fn next_in_progress_download(
        &self,
        friend_id: &FriendId,
    ) -> Result<Option<Download>, StoreError>;
    async fn update_download_state(
        &self,
        friend_id: &FriendId,
        resource_id: &str,
        state: DownloadState,
    ) -> Result<(), StoreError>;

    /// Resolve a resource `friend_id` is allowed to download. Unknown ids and
    /// resources belonging to other friends are both `NotFound`.
    async fn local_resource_for_download(
        &self,
        friend_id: &FriendId,
        resource_id: &str,
    ) -> Result<LocalResource, StoreError>;

    async fn update_friend_sent(
        &self,
        friend_id: &FriendId,
        at: DateTime<Utc>,
        bytes: u64,
    ) -> Result<(), StoreError>;
    async fn update_friend_received(
        &self,
        friend_id: &FriendId,
        at: DateTime<Utc>,
        bytes: u64,
    ) -> Result<(), StoreError>;

    /// Largest number of objects committed per pull-response transaction.
    fn max_pull_transaction_objects(&self) -> usize;
}
