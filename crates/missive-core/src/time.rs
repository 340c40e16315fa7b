//! Clock abstraction for every timestamp the queue writes.
//!
//! `dt_send`, `dt_convert`, `claimed_at` and the due-time filter for pending
//! messages all come from an injected `Clock`, so tests can pin time and
//! advance it explicitly.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicI64, AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant, SystemTime},
};

use chrono::{DateTime, Utc};

/// Clock abstraction for time operations.
///
/// Production code uses `RealClock`; tests inject a `TestClock`.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Returns the current instant for duration measurements.
    fn now(&self) -> Instant;

    /// Returns the current wall-clock time.
    fn now_system(&self) -> SystemTime;

    /// Sleeps for the specified duration.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;

    /// Current wall-clock time as a UTC timestamp.
    fn now_utc(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from(self.now_system())
    }
}

/// Real clock backed by the system time and tokio's timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealClock;

impl RealClock {
    /// Creates a new real clock instance.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for RealClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn now_system(&self) -> SystemTime {
        SystemTime::now()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Deterministic clock for tests.
///
/// Wall-clock time is stored as microseconds since the UNIX epoch, which
/// matches the precision PostgreSQL keeps for `TIMESTAMPTZ`. Sleeping
/// advances the clock instead of waiting.
#[derive(Debug, Clone)]
pub struct TestClock {
    monotonic_us: Arc<AtomicU64>,
    system_us: Arc<AtomicI64>,
    base_instant: Instant,
}

impl TestClock {
    /// Creates a test clock starting at the current wall-clock time.
    pub fn new() -> Self {
        Self::with_start_time(Utc::now())
    }

    /// Creates a test clock starting at a specific time.
    pub fn with_start_time(start: DateTime<Utc>) -> Self {
        Self {
            monotonic_us: Arc::new(AtomicU64::new(0)),
            system_us: Arc::new(AtomicI64::new(start.timestamp_micros())),
            base_instant: Instant::now(),
        }
    }

    /// Advances both clocks by the specified duration.
    pub fn advance(&self, duration: Duration) {
        let micros = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
        self.monotonic_us.fetch_add(micros, Ordering::AcqRel);
        self.system_us.fetch_add(i64::try_from(micros).unwrap_or(i64::MAX), Ordering::AcqRel);
    }

    /// Sets the wall-clock time; monotonic time only ever moves forward.
    pub fn jump_to(&self, time: DateTime<Utc>) {
        let target = time.timestamp_micros();
        let current = self.system_us.load(Ordering::Acquire);
        if target > current {
            self.advance(Duration::from_micros(u64::try_from(target - current).unwrap_or(0)));
        } else {
            self.system_us.store(target, Ordering::Release);
        }
    }

    /// Returns elapsed monotonic time since clock creation.
    pub fn elapsed(&self) -> Duration {
        Duration::from_micros(self.monotonic_us.load(Ordering::Acquire))
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TestClock {
    fn now(&self) -> Instant {
        self.base_instant + self.elapsed()
    }

    fn now_system(&self) -> SystemTime {
        SystemTime::from(self.now_utc())
    }

    fn now_utc(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp_micros(self.system_us.load(Ordering::Acquire))
            .unwrap_or_default()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        self.advance(duration);
        Box::pin(tokio::task::yield_now())
    }
}
