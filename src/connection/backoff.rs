//! Reconnect delay schedule

use std::time::Duration;

/// First reconnect delay.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(1_000);

/// Longest reconnect delay.
pub const DEFAULT_CAP_DELAY: Duration = Duration::from_millis(30_000);

/// Bounded exponential backoff: `min(base * 2^retry, cap)`.
///
/// There is no attempt limit; once the cap is reached every further retry
/// waits the cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    base: Duration,
    cap: Duration,
}

impl BackoffPolicy {
    /// A cap below the base is raised to the base.
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap: cap.max(base) }
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn cap(&self) -> Duration {
        self.cap
    }

    /// Delay before the retry that follows `retry_count` earlier retries.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let base_ms = u64::try_from(self.base.as_millis()).unwrap_or(u64::MAX);
        let cap_ms = u64::try_from(self.cap.as_millis()).unwrap_or(u64::MAX);

        let scaled = if retry_count >= u64::BITS {
            u64::MAX
        } else {
            base_ms.saturating_mul(1u64 << retry_count)
        };

        Duration::from_millis(scaled.min(cap_ms))
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DELAY, DEFAULT_CAP_DELAY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn default_schedule_doubles_then_holds_at_cap() {
        let policy = BackoffPolicy::default();
        let delays: Vec<u64> = (0..8).map(|n| policy.delay_for(n).as_millis() as u64).collect();
        assert_eq!(delays, vec![1_000, 2_000, 4_000, 8_000, 16_000, 30_000, 30_000, 30_000]);
    }

    #[test]
    fn huge_retry_counts_saturate() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_for(63), DEFAULT_CAP_DELAY);
        assert_eq!(policy.delay_for(64), DEFAULT_CAP_DELAY);
        assert_eq!(policy.delay_for(u32::MAX), DEFAULT_CAP_DELAY);
    }

    #[test]
    fn cap_below_base_is_raised() {
        let policy = BackoffPolicy::new(Duration::from_secs(5), Duration::from_secs(1));
        assert_eq!(policy.cap(), Duration::from_secs(5));
        assert_eq!(policy.delay_for(3), Duration::from_secs(5));
    }

    proptest! {
        #[test]
        fn prop_delays_are_monotonic_and_bounded(
            base_ms in 1u64..10_000,
            cap_ms in 1u64..120_000,
            retry in 0u32..200,
        ) {
            let policy = BackoffPolicy::new(Duration::from_millis(base_ms), Duration::from_millis(cap_ms));
            let current = policy.delay_for(retry);
            let next = policy.delay_for(retry + 1);

            prop_assert!(current <= next);
            prop_assert!(current <= policy.cap());
            prop_assert!(current >= policy.base().min(policy.cap()));
            prop_assert_eq!(policy.delay_for(0), policy.base());
        }
    }
}
