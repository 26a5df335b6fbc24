//! Well-known request paths served by every warren peer.

/// GET: ask the peer to initiate a pull against us. Empty body both ways.
pub const ASK_PULL_PATH: &str = "/ask-pull";

/// GET: ask the peer to share a location fix. May be rejected.
pub const ASK_LOCATION_PATH: &str = "/ask-location";

/// PUT: payload stream pushed to the peer.
pub const PUSH_PATH: &str = "/push";

/// PUT: pull request body; response is a payload stream.
pub const PULL_PATH: &str = "/pull";

/// GET: ranged resource download, selected by query parameter.
pub const DOWNLOAD_PATH: &str = "/download";

/// Query parameter naming the resource on [`DOWNLOAD_PATH`].
pub const DOWNLOAD_RESOURCE_ID_PARAM: &str = "resourceId";

/// Virtual port the hidden service exposes to peers. The server itself
/// listens on an ephemeral local port that the onion router forwards to.
pub const SERVER_VIRTUAL_PORT: u16 = 443;
