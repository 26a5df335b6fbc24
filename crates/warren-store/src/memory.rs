//! In-memory reference store.
//!
//! Backs the dev daemon and the test harness. Outbound items (self-authored
//! groups and posts) are kept in one sequence-numbered log per node; pull
//! responses replay the log past the peer's cursor, filtered to groups the
//! peer belongs to.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use warren_protocol::{FriendId, Group, Location, Payload, Post, PullRequest};

use crate::{
    Download, DownloadState, Friend, LocalResource, PayloadIter, SelfIdentity, Store, StoreError,
    SyncItem,
};

/// Default cap on objects per pull-response transaction.
pub const DEFAULT_MAX_PULL_TRANSACTION_OBJECTS: usize = 100;

/// A store mutation observable by tests.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreCall {
    PutPullResponse {
        friend_id: FriendId,
        with_request: bool,
        groups: usize,
        posts: usize,
    },
    ConfirmItemSent {
        friend_id: FriendId,
        item_id: String,
    },
    UpdateDownloadState {
        friend_id: FriendId,
        resource_id: String,
        state: DownloadState,
    },
}

#[derive(Default)]
struct TransferStats {
    last_sent: Option<DateTime<Utc>>,
    bytes_sent: u64,
    last_received: Option<DateTime<Utc>>,
    bytes_received: u64,
}

#[derive(Default)]
struct Inner {
    self_identity: Option<SelfIdentity>,
    self_location: Option<Location>,
    friends: Vec<Friend>,
    groups: HashMap<String, Group>,
    posts: HashMap<String, Post>,
    /// Self-authored items in sequence order.
    outbound: Vec<SyncItem>,
    next_sequence: i64,
    /// Highest outbound sequence each friend has acknowledged.
    acked_by_friend: HashMap<FriendId, i64>,
    /// Highest sequence received from each friend (pushed or pulled).
    received_from: HashMap<FriendId, i64>,
    downloads: HashMap<FriendId, Vec<Download>>,
    resources: HashMap<(FriendId, String), LocalResource>,
    transfer_stats: HashMap<FriendId, TransferStats>,
    /// Most recent location pushed to us, per friend.
    pushed_locations: HashMap<FriendId, Location>,
    journal: Vec<StoreCall>,
}

pub struct MemoryStore {
    inner: Mutex<Inner>,
    max_pull_transaction_objects: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_sequence: 1,
                ..Inner::default()
            }),
            max_pull_transaction_objects: DEFAULT_MAX_PULL_TRANSACTION_OBJECTS,
        }
    }

    pub fn with_max_pull_transaction_objects(mut self, max: usize) -> Self {
        self.max_pull_transaction_objects = max;
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    // -- setup API (the UI/provisioning layer in a full deployment) --

    pub fn set_self(&self, identity: SelfIdentity) {
        self.lock().self_identity = Some(identity);
    }

    pub fn add_friend(&self, friend: Friend) {
        let mut inner = self.lock();
        inner.friends.retain(|f| f.id() != friend.id());
        inner.friends.push(friend);
    }

    pub fn remove_friend(&self, friend_id: &FriendId) {
        self.lock().friends.retain(|f| f.id() != friend_id);
    }

    /// Author a group locally: assigns the next outbound sequence number.
    pub fn add_self_group(&self, mut group: Group) -> Group {
        let mut inner = self.lock();
        group.sequence_number = inner.next_sequence;
        inner.next_sequence += 1;
        inner.groups.insert(group.id.clone(), group.clone());
        inner.outbound.push(SyncItem::Group(group.clone()));
        group
    }

    /// Author a post locally: assigns the next outbound sequence number.
    pub fn add_self_post(&self, mut post: Post) -> Post {
        let mut inner = self.lock();
        post.sequence_number = inner.next_sequence;
        inner.next_sequence += 1;
        inner.posts.insert(post.id.clone(), post.clone());
        inner.outbound.push(SyncItem::Post(post.clone()));
        post
    }

    pub fn add_download(&self, download: Download) {
        let mut inner = self.lock();
        inner
            .downloads
            .entry(download.friend_id.clone())
            .or_default()
            .push(download);
    }

    pub fn add_local_resource(&self, friend_id: FriendId, resource: LocalResource) {
        self.lock()
            .resources
            .insert((friend_id, resource.resource_id.clone()), resource);
    }

    // -- test observation --

    pub fn calls(&self) -> Vec<StoreCall> {
        self.lock().journal.clone()
    }

    pub fn download_states(&self, friend_id: &FriendId) -> Vec<(String, DownloadState)> {
        self.lock()
            .downloads
            .get(friend_id)
            .map(|list| {
                list.iter()
                    .map(|d| (d.resource_id.clone(), d.state))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn acked_sequence(&self, friend_id: &FriendId) -> i64 {
        self.lock()
            .acked_by_friend
            .get(friend_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn has_post(&self, post_id: &str) -> bool {
        self.lock().posts.contains_key(post_id)
    }

    pub fn has_group(&self, group_id: &str) -> bool {
        self.lock().groups.contains_key(group_id)
    }

    pub fn friend_location(&self, friend_id: &FriendId) -> Option<Location> {
        self.lock().pushed_locations.get(friend_id).cloned()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn self_identity(&self) -> Result<SelfIdentity, StoreError> {
        self.lock().self_identity.clone().ok_or(StoreError::NotFound)
    }

    async fn friends(&self) -> Result<Vec<Friend>, StoreError> {
        Ok(self.lock().friends.clone())
    }

    async fn friend_by_id(&self, id: &FriendId) -> Result<Friend, StoreError> {
        self.lock()
            .friends
            .iter()
            .find(|f| f.id() == id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn friend_by_certificate(&self, certificate: &str) -> Result<Friend, StoreError> {
        self.lock()
            .friends
            .iter()
            .find(|f| f.public_identity.x509_certificate == certificate)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn group(&self, id: &str) -> Result<Group, StoreError> {
        self.lock().groups.get(id).cloned().ok_or(StoreError::NotFound)
    }

    async fn post(&self, id: &str) -> Result<Post, StoreError> {
        self.lock().posts.get(id).cloned().ok_or(StoreError::NotFound)
    }

    async fn self_location(&self) -> Result<Location, StoreError> {
        self.lock().self_location.clone().ok_or(StoreError::NotFound)
    }

    async fn put_group(&self, group: Group) -> Result<(), StoreError> {
        self.lock().groups.insert(group.id.clone(), group);
        Ok(())
    }

    async fn put_self_location(&self, location: Location) -> Result<(), StoreError> {
        self.lock().self_location = Some(location);
        Ok(())
    }

    async fn put_pushed_group(
        &self,
        friend_id: &FriendId,
        group: Group,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.note_received(friend_id, group.sequence_number);
        inner.groups.insert(group.id.clone(), group);
        Ok(())
    }

    async fn put_pushed_location(
        &self,
        friend_id: &FriendId,
        location: Location,
    ) -> Result<(), StoreError> {
        self.lock()
            .pushed_locations
            .insert(friend_id.clone(), location);
        Ok(())
    }

    async fn put_pushed_post(&self, friend_id: &FriendId, post: Post) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        inner.note_received(friend_id, post.sequence_number);
        let new = !inner.posts.contains_key(&post.id);
        if new {
            inner.posts.insert(post.id.clone(), post);
        }
        Ok(new)
    }

    async fn pull_request(&self, friend_id: &FriendId) -> Result<PullRequest, StoreError> {
        let inner = self.lock();
        Ok(PullRequest {
            last_received_sequence_number: inner
                .received_from
                .get(friend_id)
                .copied()
                .unwrap_or(0),
            want_reciprocal: false,
        })
    }

    async fn put_pull_response(
        &self,
        friend_id: &FriendId,
        pull_request: Option<&PullRequest>,
        groups: &[Group],
        posts: &[Post],
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.journal.push(StoreCall::PutPullResponse {
            friend_id: friend_id.clone(),
            with_request: pull_request.is_some(),
            groups: groups.len(),
            posts: posts.len(),
        });
        for group in groups {
            inner.note_received(friend_id, group.sequence_number);
            inner.groups.insert(group.id.clone(), group.clone());
        }
        for post in posts {
            inner.note_received(friend_id, post.sequence_number);
            inner.posts.insert(post.id.clone(), post.clone());
        }
        Ok(())
    }

    async fn confirm_item_sent(
        &self,
        friend_id: &FriendId,
        item: &SyncItem,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let item_id = match item {
            SyncItem::Group(group) => group.id.clone(),
            SyncItem::Post(post) => post.id.clone(),
        };
        inner.journal.push(StoreCall::ConfirmItemSent {
            friend_id: friend_id.clone(),
            item_id,
        });
        inner.note_acked(friend_id, item.sequence_number());
        Ok(())
    }

    async fn confirm_pull_request(
        &self,
        friend_id: &FriendId,
        pull_request: &PullRequest,
    ) -> Result<(), StoreError> {
        self.lock()
            .note_acked(friend_id, pull_request.last_received_sequence_number);
        Ok(())
    }

    async fn pull_response(
        &self,
        friend_id: &FriendId,
        pull_request: &PullRequest,
    ) -> Result<PayloadIter, StoreError> {
        let inner = self.lock();
        let member_of: Vec<String> = inner
            .groups
            .values()
            .filter(|g| g.members.iter().any(|m| &m.id == friend_id))
            .map(|g| g.id.clone())
            .collect();
        let cursor = pull_request.last_received_sequence_number;
        let items: Vec<Payload> = inner
            .outbound
            .iter()
            .filter(|item| item.sequence_number() > cursor)
            .filter_map(|item| match item {
                SyncItem::Group(group)
                    if group.members.iter().any(|m| &m.id == friend_id) =>
                {
                    Some(Payload::Group(group.clone()))
                }
                SyncItem::Post(post) if member_of.contains(&post.group_id) => {
                    Some(Payload::Post(post.clone()))
                }
                _ => None,
            })
            .collect();
        Ok(Box::new(items.into_iter()))
    }

    async fn next_in_progress_download(
        &self,
        friend_id: &FriendId,
    ) -> Result<Option<Download>, StoreError> {
        Ok(self
            .lock()
            .downloads
            .get(friend_id)
            .and_then(|list| {
                list.iter()
                    .find(|d| d.state == DownloadState::InProgress)
                    .cloned()
            }))
    }

    async fn update_download_state(
        &self,
        friend_id: &FriendId,
        resource_id: &str,
        state: DownloadState,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.journal.push(StoreCall::UpdateDownloadState {
            friend_id: friend_id.clone(),
            resource_id: resource_id.to_string(),
            state,
        });
        let download = inner
            .downloads
            .get_mut(friend_id)
            .and_then(|list| list.iter_mut().find(|d| d.resource_id == resource_id))
            .ok_or(StoreError::NotFound)?;
        download.state = state;
        Ok(())
    }

    async fn local_resource_for_download(
        &self,
        friend_id: &FriendId,
        resource_id: &str,
    ) -> Result<LocalResource, StoreError> {
        self.lock()
            .resources
            .get(&(friend_id.clone(), resource_id.to_string()))
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn update_friend_sent(
        &self,
        friend_id: &FriendId,
        at: DateTime<Utc>,
        bytes: u64,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if !inner.friends.iter().any(|f| f.id() == friend_id) {
            return Err(StoreError::NotFound);
        }
        let stats = inner.transfer_stats.entry(friend_id.clone()).or_default();
        stats.last_sent = Some(at);
        stats.bytes_sent += bytes;
        Ok(())
    }

    async fn update_friend_received(
        &self,
        friend_id: &FriendId,
        at: DateTime<Utc>,
        bytes: u64,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if !inner.friends.iter().any(|f| f.id() == friend_id) {
            return Err(StoreError::NotFound);
        }
        let stats = inner.transfer_stats.entry(friend_id.clone()).or_default();
        stats.last_received = Some(at);
        stats.bytes_received += bytes;
        Ok(())
    }

    fn max_pull_transaction_objects(&self) -> usize {
        self.max_pull_transaction_objects
    }
}

impl Inner {
    fn note_received(&mut self, friend_id: &FriendId, sequence: i64) {
        let cursor = self.received_from.entry(friend_id.clone()).or_insert(0);
        *cursor = (*cursor).max(sequence);
    }

    fn note_acked(&mut self, friend_id: &FriendId, sequence: i64) {
        let cursor = self.acked_by_friend.entry(friend_id.clone()).or_insert(0);
        *cursor = (*cursor).max(sequence);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warren_protocol::PublicIdentity;

    fn identity(id: &str) -> PublicIdentity {
        PublicIdentity {
            id: FriendId::from(id),
            nickname: format!("nick-{id}"),
            x509_certificate: format!("cert-{id}"),
            hidden_service_hostname: format!("{id}.onion"),
            hidden_service_auth_cookie: format!("cookie-{id}"),
        }
    }

    fn group_with_members(id: &str, members: &[&str]) -> Group {
        Group {
            id: id.into(),
            name: format!("group {id}"),
            members: members.iter().map(|m| identity(m)).collect(),
            sequence_number: 0,
            modified_timestamp: Utc::now(),
        }
    }

    fn post_in(group_id: &str, id: &str) -> Post {
        Post {
            id: id.into(),
            group_id: group_id.into(),
            content: format!("post {id}"),
            attachments: vec![],
            sequence_number: 0,
            created_timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn friend_lookup_by_certificate() {
        let store = MemoryStore::new();
        store.add_friend(Friend {
            public_identity: identity("a"),
        });

        let friend = store.friend_by_certificate("cert-a").await.unwrap();
        assert_eq!(friend.id(), &FriendId::from("a"));
        assert!(matches!(
            store.friend_by_certificate("cert-z").await,
            Err(StoreError::NotFound)
        ));
    }

    #[tokio::test]
    async fn pull_response_respects_cursor_and_membership() {
        let store = MemoryStore::new();
        store.add_friend(Friend {
            public_identity: identity("a"),
        });
        let group = store.add_self_group(group_with_members("g1", &["a"]));
        store.add_self_post(post_in("g1", "p1"));
        // A group the friend is not part of.
        store.add_self_group(group_with_members("g2", &["b"]));
        store.add_self_post(post_in("g2", "p2"));

        let request = PullRequest {
            last_received_sequence_number: 0,
            want_reciprocal: false,
        };
        let items: Vec<Payload> = store
            .pull_response(&FriendId::from("a"), &request)
            .await
            .unwrap()
            .collect();
        assert_eq!(items.len(), 2);

        // Past the group's sequence number, only the post remains.
        let request = PullRequest {
            last_received_sequence_number: group.sequence_number,
            want_reciprocal: false,
        };
        let items: Vec<Payload> = store
            .pull_response(&FriendId::from("a"), &request)
            .await
            .unwrap()
            .collect();
        assert_eq!(items.len(), 1);
        assert!(matches!(items[0], Payload::Post(_)));
    }

    #[tokio::test]
    async fn pushed_items_advance_pull_cursor() {
        let store = MemoryStore::new();
        let friend = FriendId::from("a");

        let mut post = post_in("g1", "p1");
        post.sequence_number = 5;
        assert!(store.put_pushed_post(&friend, post.clone()).await.unwrap());
        // Duplicate push is not newly accepted.
        assert!(!store.put_pushed_post(&friend, post).await.unwrap());

        let request = store.pull_request(&friend).await.unwrap();
        assert_eq!(request.last_received_sequence_number, 5);
    }

    #[tokio::test]
    async fn download_state_transitions() {
        let store = MemoryStore::new();
        let friend = FriendId::from("a");
        store.add_download(Download {
            friend_id: friend.clone(),
            resource_id: "r1".into(),
            mime_type: "image/jpeg".into(),
            size: 100,
            state: DownloadState::InProgress,
        });

        let next = store.next_in_progress_download(&friend).await.unwrap();
        assert_eq!(next.unwrap().resource_id, "r1");

        store
            .update_download_state(&friend, "r1", DownloadState::Complete)
            .await
            .unwrap();
        assert!(store
            .next_in_progress_download(&friend)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn transfer_stats_require_known_friend() {
        let store = MemoryStore::new();
        assert!(matches!(
            store
                .update_friend_sent(&FriendId::from("ghost"), Utc::now(), 10)
                .await,
            Err(StoreError::NotFound)
        ));
    }
}
