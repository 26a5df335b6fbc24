//! Typed events and the handle used to post them.
//!
//! Everything that moves the engine — local edits, peer-driven changes,
//! transport signals — arrives as an [`Event`] and is dispatched by the
//! engine's event loop, one reaction at a time.

use tokio::sync::mpsc;
use warren_protocol::{FriendId, Location};

#[derive(Debug, Clone)]
pub enum Event {
    /// The onion router has an established circuit; peer requests can begin.
    CircuitEstablished,
    /// Our own identity changed: transport credentials must be reloaded.
    UpdatedSelf,
    AddedFriend { friend_id: FriendId },
    RemovedFriend { friend_id: FriendId },
    /// A friend's record changed, implying communication was observed.
    UpdatedFriend { friend_id: FriendId },
    UpdatedSelfGroup { group_id: String },
    UpdatedSelfLocation,
    UpdatedSelfPost { post_id: String },
    AddedDownload { friend_id: FriendId },
    /// The location provider produced a fix; persisted before fan-out.
    NewSelfLocationFix { location: Location },
    PreferenceChanged { key: String },
}

/// Cloneable sender for posting events to the engine.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::UnboundedSender<Event>,
}

impl EngineHandle {
    pub fn post(&self, event: Event) {
        if self.tx.send(event).is_err() {
            tracing::debug!("engine dropped; discarding event");
        }
    }
}

pub(crate) fn channel() -> (EngineHandle, mpsc::UnboundedReceiver<Event>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EngineHandle { tx }, rx)
}
