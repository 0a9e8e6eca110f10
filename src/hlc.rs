//! Hybrid logical clock timestamps.
//!
//! A [`Timestamp`] pairs a physical wall time (nanoseconds since the Unix
//! epoch) with a logical counter. Timestamps are totally ordered by wall time
//! then logical. The zero timestamp marks inline (unversioned) keys.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Nanoseconds per second, used for stats ages.
pub const NANOS_PER_SEC: u64 = 1_000_000_000;

/// An HLC timestamp `(wall_time, logical)`.
#[derive(
    Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Timestamp {
    /// Physical component, nanoseconds since the Unix epoch.
    pub wall_time: u64,
    /// Logical counter breaking ties between equal wall times.
    pub logical: u32,
}

impl Timestamp {
    /// The zero timestamp (inline keys, "unset").
    pub const ZERO: Timestamp = Timestamp {
        wall_time: 0,
        logical: 0,
    };

    /// The largest representable timestamp.
    pub const MAX: Timestamp = Timestamp {
        wall_time: u64::MAX,
        logical: u32::MAX,
    };

    pub const fn new(wall_time: u64, logical: u32) -> Self {
        Self { wall_time, logical }
    }

    /// Timestamp at a whole wall time with a zero logical component.
    pub const fn from_wall(wall_time: u64) -> Self {
        Self {
            wall_time,
            logical: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::ZERO
    }

    /// The smallest timestamp strictly greater than `self`.
    pub fn next(&self) -> Timestamp {
        if self.logical == u32::MAX {
            Timestamp::new(self.wall_time.saturating_add(1), 0)
        } else {
            Timestamp::new(self.wall_time, self.logical + 1)
        }
    }

    /// The largest timestamp strictly smaller than `self`.
    pub fn prev(&self) -> Timestamp {
        if self.logical > 0 {
            Timestamp::new(self.wall_time, self.logical - 1)
        } else if self.wall_time > 0 {
            Timestamp::new(self.wall_time - 1, u32::MAX)
        } else {
            Timestamp::ZERO
        }
    }

    /// Like [`prev`](Self::prev) but drops the logical component when
    /// stepping back across a wall time boundary.
    pub fn floor_prev(&self) -> Timestamp {
        if self.logical > 0 {
            Timestamp::new(self.wall_time, self.logical - 1)
        } else if self.wall_time > 0 {
            Timestamp::new(self.wall_time - 1, 0)
        } else {
            Timestamp::ZERO
        }
    }

    /// Raises `self` to `other` if `other` is larger. Returns true if it moved.
    pub fn forward(&mut self, other: Timestamp) -> bool {
        if other > *self {
            *self = other;
            true
        } else {
            false
        }
    }

    /// Lowers `self` to `other` if `other` is smaller.
    pub fn backward(&mut self, other: Timestamp) {
        if other < *self {
            *self = other;
        }
    }

    /// Returns a timestamp advanced by `nanos` of wall time.
    pub fn add_nanos(&self, nanos: u64) -> Timestamp {
        Timestamp::new(self.wall_time.saturating_add(nanos), self.logical)
    }

    /// Wall time truncated to whole seconds.
    pub fn wall_secs(&self) -> i64 {
        (self.wall_time / NANOS_PER_SEC) as i64
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{:09},{}",
            self.wall_time / NANOS_PER_SEC,
            self.wall_time % NANOS_PER_SEC,
            self.logical
        )
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Source of HLC timestamps.
pub trait Clock: Send + Sync {
    /// Returns a timestamp greater than any previously returned or observed.
    fn now(&self) -> Timestamp;

    /// Folds a timestamp received from elsewhere into the clock.
    fn update(&self, remote: Timestamp);
}

/// A hybrid logical clock driven by the system wall clock.
pub struct HlcClock {
    state: Mutex<Timestamp>,
    physical: Box<dyn Fn() -> u64 + Send + Sync>,
}

impl HlcClock {
    /// Clock reading the system time.
    pub fn new() -> Self {
        Self::with_physical(Box::new(unix_nanos))
    }

    /// Clock reading physical time from `physical`.
    pub fn with_physical(physical: Box<dyn Fn() -> u64 + Send + Sync>) -> Self {
        Self {
            state: Mutex::new(Timestamp::ZERO),
            physical,
        }
    }
}

impl Default for HlcClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for HlcClock {
    fn now(&self) -> Timestamp {
        let physical = (self.physical)();
        let mut state = self.state.lock();
        if physical > state.wall_time {
            *state = Timestamp::from_wall(physical);
        } else {
            *state = state.next();
        }
        *state
    }

    fn update(&self, remote: Timestamp) {
        let mut state = self.state.lock();
        state.forward(remote);
    }
}

/// A clock whose physical time is set by hand. Used by tests and tools.
#[derive(Debug, Default)]
pub struct ManualClock {
    nanos: AtomicU64,
}

impl ManualClock {
    pub fn new(nanos: u64) -> Self {
        Self {
            nanos: AtomicU64::new(nanos),
        }
    }

    pub fn set(&self, nanos: u64) {
        self.nanos.store(nanos, Ordering::SeqCst);
    }

    pub fn increment(&self, nanos: u64) {
        self.nanos.fetch_add(nanos, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp::from_wall(self.nanos.load(Ordering::SeqCst))
    }

    fn update(&self, remote: Timestamp) {
        self.nanos.fetch_max(remote.wall_time, Ordering::SeqCst);
    }
}

fn unix_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}
