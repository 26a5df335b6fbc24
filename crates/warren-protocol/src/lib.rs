pub mod paths;
pub mod stream;
pub mod types;
pub mod validation;

pub use types::{
    ByteRange, FriendId, Group, Location, Payload, Post, PublicIdentity, PullRequest, ResourceRef,
};
