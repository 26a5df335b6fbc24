//! Engine intent state: task slots, push queues, location recipients.
//!
//! All mutations go through [`SharedState`], a narrow API over one coarse
//! lock. The lock is never held across an await point; task bodies do their
//! network I/O outside it and come back only to dequeue or complete.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use tokio::task::AbortHandle;
use warren_protocol::{FriendId, Payload};

/// The five per-friend synchronization task kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    AskPull,
    AskLocation,
    PushTo,
    PullFrom,
    DownloadFrom,
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            TaskKind::AskPull => "ask-pull",
            TaskKind::AskLocation => "ask-location",
            TaskKind::PushTo => "push-to",
            TaskKind::PullFrom => "pull-from",
            TaskKind::DownloadFrom => "download-from",
        })
    }
}

#[derive(Default)]
struct Inner {
    /// In-flight task per (kind, friend). Presence of the key is occupancy;
    /// every exit path removes it.
    slots: HashMap<(TaskKind, FriendId), AbortHandle>,
    push_queues: HashMap<FriendId, VecDeque<Payload>>,
    location_recipients: HashSet<FriendId>,
    circuit_established: bool,
}

#[derive(Default)]
pub struct SharedState {
    inner: Mutex<Inner>,
}

impl SharedState {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn circuit_established(&self) -> bool {
        self.lock().circuit_established
    }

    pub fn set_circuit_established(&self, established: bool) {
        self.lock().circuit_established = established;
    }

    /// Occupy the slot and spawn via `spawn` if it is free. Returns false
    /// without side effects when a task is already in flight.
    pub fn occupy(
        &self,
        kind: TaskKind,
        friend_id: &FriendId,
        spawn: impl FnOnce() -> AbortHandle,
    ) -> bool {
        let mut inner = self.lock();
        let key = (kind, friend_id.clone());
        if inner.slots.contains_key(&key) {
            return false;
        }
        // Spawning under the lock is deliberate: the new task's first slot
        // access serializes behind this insert.
        let handle = spawn();
        inner.slots.insert(key, handle);
        true
    }

    /// Clear the slot. Idempotent; called on every task exit path.
    pub fn complete(&self, kind: TaskKind, friend_id: &FriendId) {
        self.lock().slots.remove(&(kind, friend_id.clone()));
    }

    pub fn enqueue_push(&self, friend_id: &FriendId, payload: Payload) {
        self.lock()
            .push_queues
            .entry(friend_id.clone())
            .or_default()
            .push_back(payload);
    }

    /// Pop the next payload for the friend's push task, or clear the PushTo
    /// slot when the queue is empty.
    ///
    /// Checking emptiness and releasing the slot in one critical section
    /// closes the window where a payload enqueued after the last dequeue
    /// would be stranded behind a still-occupied slot.
    pub fn dequeue_or_complete(&self, friend_id: &FriendId) -> Option<Payload> {
        let mut inner = self.lock();
        match inner
            .push_queues
            .get_mut(friend_id)
            .and_then(|queue| queue.pop_front())
        {
            Some(payload) => Some(payload),
            None => {
                inner.slots.remove(&(TaskKind::PushTo, friend_id.clone()));
                None
            }
        }
    }

    pub fn add_location_recipient(&self, friend_id: FriendId) {
        self.lock().location_recipients.insert(friend_id);
    }

    pub fn drain_location_recipients(&self) -> Vec<FriendId> {
        self.lock().location_recipients.drain().collect()
    }

    /// Drop all intent state. Used on engine stop.
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.slots.clear();
        inner.push_queues.clear();
        inner.location_recipients.clear();
        inner.circuit_established = false;
    }

    pub fn in_flight_count(&self) -> usize {
        self.lock().slots.len()
    }

    pub fn is_occupied(&self, kind: TaskKind, friend_id: &FriendId) -> bool {
        self.lock().slots.contains_key(&(kind, friend_id.clone()))
    }

    pub fn queued_push_count(&self, friend_id: &FriendId) -> usize {
        self.lock()
            .push_queues
            .get(friend_id)
            .map(|q| q.len())
            .unwrap_or(0)
    }

    pub fn location_recipient_count(&self) -> usize {
        self.lock().location_recipients.len()
    }
}
