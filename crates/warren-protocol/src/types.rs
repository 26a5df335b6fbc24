use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stable opaque identifier for a peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FriendId(pub String);

impl FriendId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for FriendId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FriendId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Everything a peer publishes about itself: how to address it and how to
/// authenticate it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PublicIdentity {
    pub id: FriendId,
    pub nickname: String,
    /// PEM-encoded X.509 certificate presented on mutual-TLS connections.
    pub x509_certificate: String,
    pub hidden_service_hostname: String,
    /// Client authorization cookie for the peer's hidden service.
    pub hidden_service_auth_cookie: String,
}

/// A shared group: membership list plus the author's publish cursor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Group {
    pub id: String,
    pub name: String,
    pub members: Vec<PublicIdentity>,
    /// Position in the author's outbound item sequence; drives pull cursors.
    pub sequence_number: i64,
    pub modified_timestamp: DateTime<Utc>,
}

/// Reference to a downloadable attachment published with a post.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ResourceRef {
    pub resource_id: String,
    pub mime_type: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Post {
    pub id: String,
    pub group_id: String,
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<ResourceRef>,
    /// Position in the author's outbound item sequence; drives pull cursors.
    pub sequence_number: i64,
    pub created_timestamp: DateTime<Utc>,
}

/// A self-reported location fix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Location {
    pub timestamp: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    /// Reverse-geocoded address, or empty when unavailable.
    pub street_address: String,
}

/// One unit of syncable state on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    Group(Group),
    Post(Post),
    Location(Location),
}

/// Byte range carried in a download request's Range header. `end` is
/// inclusive; `None` means "to the end of the resource".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteRange {
    pub start: u64,
    pub end: Option<u64>,
}

impl ByteRange {
    /// Open-ended range starting at `start`.
    pub fn from_offset(start: u64) -> Self {
        Self { start, end: None }
    }
}

/// Per-friend pull cursor. Sent by the puller so the peer responds with only
/// newer items; the peer also treats the cursor as an acknowledgment of
/// everything at or below it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PullRequest {
    /// Highest sequence number already received from this peer.
    pub last_received_sequence_number: i64,
    /// Set on the first request of an exchange: also asks the peer to
    /// initiate a pull in the other direction.
    pub want_reciprocal: bool,
}
