//! Queue-time pacing for expanded bulk envelopes.
//!
//! Recipients of one envelope are spread over a window so the external API
//! never sees a burst. The window is at least `min_window`, and grows to
//! `n * 60 / max_rate_per_minute` seconds once the recipient count exceeds
//! the per-minute rate. The first three recipients get a short warm-up
//! offset of a few whole seconds; every later recipient `i` lands at
//! `i * base + base * (0.5 + U)` with `U` uniform in `[0, 1)`.
//!
//! Randomness is always passed in, so a seeded generator reproduces a
//! schedule exactly.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Number of leading recipients that get a warm-up offset.
pub const WARM_UP_RECIPIENTS: usize = 3;

/// Inclusive whole-second ranges of the warm-up offsets.
const WARM_UP_SECONDS: [(u64, u64); WARM_UP_RECIPIENTS] = [(1, 3), (2, 5), (3, 8)];

/// Pacing parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacingSchedule {
    /// Recipient count above which the window grows with the envelope.
    pub max_rate_per_minute: u32,
    /// Smallest window recipients are spread across.
    pub min_window: Duration,
}

impl Default for PacingSchedule {
    fn default() -> Self {
        Self { max_rate_per_minute: 100, min_window: Duration::from_secs(30) }
    }
}

/// Window and spacing computed for one envelope size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacingPlan {
    recipients: usize,
    window: Duration,
    base_delay: Duration,
}

impl PacingSchedule {
    /// Computes the plan for `recipients` messages.
    pub fn plan(&self, recipients: usize) -> PacingPlan {
        let rate = u64::from(self.max_rate_per_minute.max(1));
        let count = u64::try_from(recipients).unwrap_or(u64::MAX);

        let window = if count <= rate {
            self.min_window
        } else {
            Duration::from_secs(count.saturating_mul(60) / rate).max(self.min_window)
        };

        let base_delay = match u32::try_from(recipients) {
            Ok(0) => Duration::ZERO,
            Ok(n) => window / n,
            Err(_) => window.div_f64(recipients as f64),
        };

        PacingPlan { recipients, window, base_delay }
    }

    /// Computes one queue time per recipient, in recipient order.
    pub fn queue_times<R: Rng>(
        &self,
        dt_store: DateTime<Utc>,
        recipients: usize,
        rng: &mut R,
    ) -> Vec<DateTime<Utc>> {
        let plan = self.plan(recipients);
        (0..recipients).map(|i| plan.queue_time(dt_store, i, rng)).collect()
    }
}

impl PacingPlan {
    /// Number of recipients the plan was computed for.
    pub fn recipients(&self) -> usize {
        self.recipients
    }

    /// Span the recipients are spread across.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Average spacing between consecutive recipients.
    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    /// Offset of recipient `index` from the envelope's creation time.
    pub fn offset<R: Rng>(&self, index: usize, rng: &mut R) -> Duration {
        if let Some(&(low, high)) = WARM_UP_SECONDS.get(index) {
            return Duration::from_secs(rng.random_range(low..=high));
        }

        let jitter: f64 = rng.random();
        let seconds = self.base_delay.as_secs_f64() * (index as f64 + 0.5 + jitter);
        Duration::try_from_secs_f64(seconds).unwrap_or(Duration::MAX)
    }

    /// Queue time of recipient `index`.
    pub fn queue_time<R: Rng>(
        &self,
        dt_store: DateTime<Utc>,
        index: usize,
        rng: &mut R,
    ) -> DateTime<Utc> {
        let offset = self.offset(index, rng);
        // Microsecond precision matches what the store keeps.
        let micros = i64::try_from(offset.as_micros()).unwrap_or(i64::MAX);
        dt_store
            .checked_add_signed(chrono::Duration::microseconds(micros))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap()
    }

    #[test]
    fn small_envelopes_use_minimum_window() {
        let plan = PacingSchedule::default().plan(5);
        assert_eq!(plan.recipients(), 5);
        assert_eq!(plan.window(), Duration::from_secs(30));
        assert_eq!(plan.base_delay(), Duration::from_secs(6));

        let plan = PacingSchedule::default().plan(100);
        assert_eq!(plan.window(), Duration::from_secs(30));
        assert_eq!(plan.base_delay(), Duration::from_millis(300));
    }

    #[test]
    fn large_envelopes_respect_rate_ceiling() {
        let plan = PacingSchedule::default().plan(250);
        assert_eq!(plan.window(), Duration::from_secs(150));
        assert_eq!(plan.base_delay(), Duration::from_millis(600));

        // Integer seconds: 101 * 60 / 100 = 60.
        assert_eq!(PacingSchedule::default().plan(101).window(), Duration::from_secs(60));
    }

    #[test]
    fn empty_envelope_has_no_spacing() {
        let schedule = PacingSchedule::default();
        assert_eq!(schedule.plan(0).base_delay(), Duration::ZERO);
        assert!(schedule.queue_times(t0(), 0, &mut StdRng::seed_from_u64(1)).is_empty());
    }

    #[test]
    fn warm_up_offsets_are_whole_seconds_in_range() {
        let plan = PacingSchedule::default().plan(10);
        let mut rng = StdRng::seed_from_u64(42);

        for _ in 0..200 {
            for (i, (low, high)) in WARM_UP_SECONDS.iter().enumerate() {
                let offset = plan.offset(i, &mut rng);
                assert_eq!(offset.subsec_nanos(), 0);
                assert!((*low..=*high).contains(&offset.as_secs()), "index {i}: {offset:?}");
            }
        }
    }

    #[test]
    fn later_offsets_jitter_around_linear_schedule() {
        let plan = PacingSchedule::default().plan(5);
        let mut rng = StdRng::seed_from_u64(7);

        for _ in 0..200 {
            let third = plan.offset(3, &mut rng);
            let fourth = plan.offset(4, &mut rng);
            assert!(third >= Duration::from_secs(21) && third < Duration::from_secs(27));
            assert!(fourth >= Duration::from_secs(27) && fourth < Duration::from_secs(33));
        }
    }

    #[test]
    fn oversized_window_saturates_instead_of_overflowing() {
        let schedule =
            PacingSchedule { max_rate_per_minute: 100, min_window: Duration::from_secs(u64::MAX) };
        let plan = schedule.plan(4);
        let mut rng = StdRng::seed_from_u64(3);

        assert_eq!(plan.offset(10, &mut rng), Duration::MAX);
        assert_eq!(plan.queue_time(t0(), 3, &mut rng), DateTime::<Utc>::MAX_UTC);
    }

    #[test]
    fn seeded_generators_reproduce_schedule() {
        let schedule = PacingSchedule::default();

        let a = schedule.queue_times(t0(), 40, &mut StdRng::seed_from_u64(99));
        let b = schedule.queue_times(t0(), 40, &mut StdRng::seed_from_u64(99));

        assert_eq!(a, b);
        assert!(a.iter().all(|t| *t > t0()));
    }

    #[test]
    fn custom_rate_and_window() {
        let schedule =
            PacingSchedule { max_rate_per_minute: 10, min_window: Duration::from_secs(5) };
        assert_eq!(schedule.plan(10).window(), Duration::from_secs(5));
        assert_eq!(schedule.plan(20).window(), Duration::from_secs(120));
    }
}
