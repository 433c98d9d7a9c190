use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::Rng;
use tokio::time::Instant;

/// Source of monotonic time for the election core.
///
/// Instants are `tokio::time::Instant` so that a paused tokio runtime drives
/// every timer in virtual time.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;

    /// Unix time in milliseconds corresponding to a monotonic instant.
    fn unix_millis(&self, at: Instant) -> u64;
}

fn unix_now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy)]
struct Anchor {
    origin: Instant,
    origin_unix_ms: u64,
}

impl Anchor {
    fn capture() -> Self {
        Self {
            origin: Instant::now(),
            origin_unix_ms: unix_now_ms(),
        }
    }

    fn unix_millis(&self, at: Instant) -> u64 {
        self.origin_unix_ms + at.saturating_duration_since(self.origin).as_millis() as u64
    }
}

/// Clock backed by the tokio runtime's monotonic time.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    anchor: Anchor,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            anchor: Anchor::capture(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn unix_millis(&self, at: Instant) -> u64 {
        self.anchor.unix_millis(at)
    }
}

/// Clock that only moves when told to. Clones share the same time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    anchor: Anchor,
    elapsed: Arc<Mutex<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            anchor: Anchor::capture(),
            elapsed: Arc::new(Mutex::new(Duration::ZERO)),
        }
    }

    pub fn advance(&self, duration: Duration) {
        let mut elapsed = self.elapsed.lock().unwrap_or_else(|e| e.into_inner());
        *elapsed += duration;
    }

    /// Moves the clock forward to `at`. Earlier instants are ignored.
    pub fn advance_to(&self, at: Instant) {
        let target = at.saturating_duration_since(self.anchor.origin);
        let mut elapsed = self.elapsed.lock().unwrap_or_else(|e| e.into_inner());
        if target > *elapsed {
            *elapsed = target;
        }
    }

    pub fn elapsed(&self) -> Duration {
        *self.elapsed.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.anchor.origin + self.elapsed()
    }

    fn unix_millis(&self, at: Instant) -> u64 {
        self.anchor.unix_millis(at)
    }
}

/// Inclusive range election timeouts are drawn from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutRange {
    min: Duration,
    max: Duration,
}

impl TimeoutRange {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self { min, max }
    }

    pub fn min(&self) -> Duration {
        self.min
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    /// Draws a fresh timeout uniformly from the range, at nanosecond
    /// resolution so that two nodes practically never share a deadline.
    pub fn draw<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        if self.min >= self.max {
            return self.min;
        }
        rng.random_range(self.min..=self.max)
    }
}

/// A one-shot deadline. Arming always replaces the pending deadline.
#[derive(Debug, Clone, Default)]
pub struct Timer {
    deadline: Option<Instant>,
}

impl Timer {
    pub fn new() -> Self {
        Self { deadline: None }
    }

    pub fn arm(&mut self, now: Instant, after: Duration) -> Instant {
        let deadline = now + after;
        self.deadline = Some(deadline);
        deadline
    }

    pub fn disarm(&mut self) {
        self.deadline = None;
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|d| d <= now)
    }
}
