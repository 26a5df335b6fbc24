//! Single-threaded timer service.
//!
//! One task owns a priority queue of deadlines; callers schedule, reschedule,
//! or cancel named timers, and expirations are reported on a channel the
//! engine's event loop consumes. Scheduling an already-armed key resets it,
//! which is exactly the debounce the preference-restart and watchdog timers
//! need.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::time::DelayQueue;

/// Names for the engine's timers. One slot per key: watchdog and debounce
/// timers reset in place, the download ticker re-arms itself on expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKey {
    /// Restart when the circuit stalls: armed with the not-connected
    /// interval on start, re-armed with the no-communication interval on
    /// every confirmed peer interaction.
    Watchdog,
    /// Debounced restart after a preference change.
    PreferenceRestart,
    /// Periodic download retry tick.
    DownloadRetry,
}

enum TimerCmd {
    Schedule { key: TimerKey, delay: Duration },
    Cancel(TimerKey),
}

/// Handle to the timer task. Dropping every handle stops the task.
#[derive(Clone)]
pub struct TimerService {
    cmd_tx: mpsc::UnboundedSender<TimerCmd>,
}

impl TimerService {
    /// Spawn the timer task; expired keys are sent to `fired_tx`.
    pub fn start(fired_tx: mpsc::UnboundedSender<TimerKey>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        tokio::spawn(run(cmd_rx, fired_tx));
        Self { cmd_tx }
    }

    /// Arm `key` to fire after `delay`, replacing any earlier deadline.
    pub fn schedule(&self, key: TimerKey, delay: Duration) {
        let _ = self.cmd_tx.send(TimerCmd::Schedule { key, delay });
    }

    pub fn cancel(&self, key: TimerKey) {
        let _ = self.cmd_tx.send(TimerCmd::Cancel(key));
    }
}

async fn run(mut cmd_rx: mpsc::UnboundedReceiver<TimerCmd>, fired_tx: mpsc::UnboundedSender<TimerKey>) {
    let mut queue: DelayQueue<TimerKey> = DelayQueue::new();
    let mut armed: HashMap<TimerKey, tokio_util::time::delay_queue::Key> = HashMap::new();

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(TimerCmd::Schedule { key, delay }) => {
                    match armed.get(&key) {
                        Some(queue_key) => queue.reset(queue_key, delay),
                        None => {
                            armed.insert(key, queue.insert(key, delay));
                        }
                    }
                }
                Some(TimerCmd::Cancel(key)) => {
                    if let Some(queue_key) = armed.remove(&key) {
                        queue.remove(&queue_key);
                    }
                }
                None => break,
            },
            expired = std::future::poll_fn(|cx| {
                // An empty queue reports Ready(None) forever; park instead.
                // Commands wake the loop and rebuild this future.
                if queue.is_empty() {
                    return std::task::Poll::Pending;
                }
                queue.poll_expired(cx)
            }) => {
                if let Some(expired) = expired {
                    let key = expired.into_inner();
                    armed.remove(&key);
                    if fired_tx.send(key).is_err() {
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn fires_after_delay() {
        let (fired_tx, mut fired_rx) = mpsc::unbounded_channel();
        let timers = TimerService::start(fired_tx);
        timers.schedule(TimerKey::Watchdog, Duration::from_secs(60));

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(fired_rx.recv().await, Some(TimerKey::Watchdog));
    }

    #[tokio::test(start_paused = true)]
    async fn reschedule_replaces_deadline() {
        let (fired_tx, mut fired_rx) = mpsc::unbounded_channel();
        let timers = TimerService::start(fired_tx);

        // Ten schedules one second apart: a single firing ~5s after the last.
        for _ in 0..10 {
            timers.schedule(TimerKey::PreferenceRestart, Duration::from_secs(5));
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        tokio::time::sleep(Duration::from_secs(6)).await;

        assert_eq!(fired_rx.recv().await, Some(TimerKey::PreferenceRestart));
        assert!(fired_rx.try_recv().is_err(), "debounce fired more than once");
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_disarms() {
        let (fired_tx, mut fired_rx) = mpsc::unbounded_channel();
        let timers = TimerService::start(fired_tx);
        timers.schedule(TimerKey::DownloadRetry, Duration::from_secs(10));
        timers.cancel(TimerKey::DownloadRetry);

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(fired_rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn independent_keys_fire_in_deadline_order() {
        let (fired_tx, mut fired_rx) = mpsc::unbounded_channel();
        let timers = TimerService::start(fired_tx);
        timers.schedule(TimerKey::Watchdog, Duration::from_secs(30));
        timers.schedule(TimerKey::DownloadRetry, Duration::from_secs(10));

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(fired_rx.recv().await, Some(TimerKey::DownloadRetry));
        assert_eq!(fired_rx.recv().await, Some(TimerKey::Watchdog));
    }
}
