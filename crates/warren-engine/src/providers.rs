//! Device-side collaborators: the location provider and network monitor.

use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

use warren_protocol::Location;

use crate::event::{EngineHandle, Event};

/// Produces location fixes on demand. `start` begins an acquisition; the
/// provider posts [`Event::NewSelfLocationFix`] when a fix is ready.
pub trait LocationSource: Send + Sync {
    fn start(&self);
    fn stop(&self);
}

/// Reports the current network link, backing the files-on-Wi-Fi-only gate.
pub trait NetworkMonitor: Send + Sync {
    fn is_on_wifi(&self) -> bool;
}

/// Network monitor with a fixed, externally-settable answer. Stands in for a
/// platform connectivity API in the dev daemon and tests.
#[derive(Default)]
pub struct FixedNetwork {
    wifi: AtomicBool,
}

impl FixedNetwork {
    pub fn wifi() -> Self {
        let network = Self::default();
        network.set_wifi(true);
        network
    }

    pub fn set_wifi(&self, on_wifi: bool) {
        self.wifi.store(on_wifi, Ordering::SeqCst);
    }
}

impl NetworkMonitor for FixedNetwork {
    fn is_on_wifi(&self) -> bool {
        self.wifi.load(Ordering::SeqCst)
    }
}

/// Location source that replays a preset fix whenever started. Stands in for
/// a GPS provider in the dev daemon and tests.
#[derive(Default)]
pub struct StaticLocationSource {
    fix: RwLock<Option<Location>>,
    handle: RwLock<Option<EngineHandle>>,
}

impl StaticLocationSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&self, handle: EngineHandle) {
        *self.handle.write().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    pub fn set_fix(&self, location: Location) {
        *self.fix.write().unwrap_or_else(|e| e.into_inner()) = Some(location);
    }
}

impl LocationSource for StaticLocationSource {
    fn start(&self) {
        let fix = self.fix.read().unwrap_or_else(|e| e.into_inner()).clone();
        let handle = self.handle.read().unwrap_or_else(|e| e.into_inner()).clone();
        if let (Some(location), Some(handle)) = (fix, handle) {
            handle.post(Event::NewSelfLocationFix { location });
        }
    }

    fn stop(&self) {}
}
