//! Injectable clock.
//!
//! Every "how long since" check in the DHT routes through a [`TimeProvider`]
//! so tests can drive liveness transitions without sleeping. Production code
//! installs [`SystemTimeProvider`] once at startup.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Source of wall-clock time, in whole seconds since the Unix epoch.
pub trait TimeProvider: Send + Sync {
    fn now_secs(&self) -> u64;
}

/// Shared handle to a clock.
pub type Clock = Arc<dyn TimeProvider>;

/// Real wall clock.
#[derive(Debug, Default)]
pub struct SystemTimeProvider;

impl TimeProvider for SystemTimeProvider {
    fn now_secs(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

/// Manually advanced clock for tests.
///
/// Starts at a fixed epoch offset so zero-valued "never seen" sentinels
/// stay distinguishable from freshly stamped entries.
#[derive(Debug)]
pub struct MockTimeProvider {
    now: AtomicU64,
}

impl MockTimeProvider {
    pub fn new(start_secs: u64) -> Self {
        Self { now: AtomicU64::new(start_secs) }
    }

    pub fn advance(&self, secs: u64) {
        self.now.fetch_add(secs, Ordering::SeqCst);
    }

    pub fn set(&self, secs: u64) {
        self.now.store(secs, Ordering::SeqCst);
    }
}

impl TimeProvider for MockTimeProvider {
    fn now_secs(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Default production clock.
pub fn system_clock() -> Clock {
    Arc::new(SystemTimeProvider)
}
