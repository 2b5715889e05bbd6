//! Release delay computation for transiently failed events.
//!
//! A failed event is released back to the broker with a delay that grows with
//! its delivery count. The broker only supports a discrete set of delays, so
//! the intended delay is rounded up to the next supported [`ReleaseDelay`].
//!
//! Two policies exist:
//!
//! - **Exponential** (default): `2^(delivery_count - 1)` seconds.
//! - **Scheduled**: an explicit ordered list of delays; delivery `d` uses entry
//!   `min(d - 1, len - 1)`, so the last entry repeats forever.
//!
//! A delivery count of zero is treated as one.
//!
//! # Example
//!
//! ```rust
//! use event_puller_core::ReleaseDelay;
//! use event_puller_runtime::retry::RetryPolicy;
//! use std::time::Duration;
//!
//! # fn example() -> Result<(), event_puller_runtime::RuntimeError> {
//! let policy = RetryPolicy::builder()
//!     .delay(Duration::from_secs(5))
//!     .delay(Duration::from_secs(45))
//!     .build()?;
//!
//! assert_eq!(policy.release_delay(1), ReleaseDelay::TenSeconds);
//! assert_eq!(policy.release_delay(2), ReleaseDelay::OneMinute);
//! assert_eq!(policy.release_delay(9), ReleaseDelay::OneMinute);
//! # Ok(())
//! # }
//! ```

use crate::error::RuntimeError;
use event_puller_core::ReleaseDelay;
use std::time::Duration;

/// How the release delay grows with the delivery count.
///
/// # Default Values
///
/// Exponential backoff with no schedule.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryPolicy {
    schedule: Option<Vec<Duration>>,
}

impl RetryPolicy {
    /// Exponential backoff: `2^(d - 1)` seconds.
    #[must_use]
    pub const fn exponential() -> Self {
        Self { schedule: None }
    }

    /// Explicit schedule, indexed by delivery count.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Config`] if the schedule is empty.
    pub fn scheduled(schedule: impl IntoIterator<Item = Duration>) -> Result<Self, RuntimeError> {
        let schedule: Vec<Duration> = schedule.into_iter().collect();
        if schedule.is_empty() {
            return Err(RuntimeError::Config(
                "retry schedule must contain at least one delay".to_string(),
            ));
        }
        Ok(Self {
            schedule: Some(schedule),
        })
    }

    /// Create a new policy builder.
    #[must_use]
    pub const fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder { delays: Vec::new() }
    }

    /// The explicit schedule, if any.
    #[must_use]
    pub fn schedule(&self) -> Option<&[Duration]> {
        self.schedule.as_deref()
    }

    /// Delay the policy asks for, before rounding to a supported value.
    #[must_use]
    pub fn intended_delay(&self, delivery_count: u32) -> Duration {
        let attempt = delivery_count.max(1);
        match self.schedule.as_deref() {
            Some(schedule) if !schedule.is_empty() => {
                let index = usize::try_from(attempt - 1)
                    .unwrap_or(usize::MAX)
                    .min(schedule.len() - 1);
                schedule[index]
            },
            _ => exponential_delay(attempt),
        }
    }

    /// Delay to release an event with after its `delivery_count`th attempt failed.
    #[must_use]
    pub fn release_delay(&self, delivery_count: u32) -> ReleaseDelay {
        let intended = self.intended_delay(delivery_count);
        let delay = ReleaseDelay::at_least(intended);
        tracing::trace!(
            delivery_count,
            intended_secs = intended.as_secs(),
            delay = %delay,
            "Computed release delay"
        );
        delay
    }
}

/// `2^(delivery_count - 1)` seconds, saturating.
#[must_use]
pub fn exponential_delay(delivery_count: u32) -> Duration {
    let exponent = delivery_count.max(1) - 1;
    Duration::from_secs(2_u64.checked_pow(exponent).unwrap_or(u64::MAX))
}

/// Builder for a scheduled [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    delays: Vec<Duration>,
}

impl RetryPolicyBuilder {
    /// Append one delay to the schedule.
    #[must_use]
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delays.push(delay);
        self
    }

    /// Append several delays to the schedule.
    #[must_use]
    pub fn delays(mut self, delays: impl IntoIterator<Item = Duration>) -> Self {
        self.delays.extend(delays);
        self
    }

    /// Build the [`RetryPolicy`].
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Config`] if no delay was added.
    pub fn build(self) -> Result<RetryPolicy, RuntimeError> {
        RetryPolicy::scheduled(self.delays)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn exponential_doubles_per_delivery() {
        assert_eq!(exponential_delay(1), Duration::from_secs(1));
        assert_eq!(exponential_delay(2), Duration::from_secs(2));
        assert_eq!(exponential_delay(5), Duration::from_secs(16));
        assert_eq!(exponential_delay(0), exponential_delay(1));
    }

    #[test]
    fn exponential_saturates() {
        assert_eq!(exponential_delay(65), Duration::from_secs(u64::MAX));
        assert_eq!(exponential_delay(u32::MAX), Duration::from_secs(u64::MAX));
    }

    #[test]
    fn exponential_policy_rounds_up_to_supported_delays() {
        let policy = RetryPolicy::exponential();
        assert_eq!(policy.release_delay(1), ReleaseDelay::TenSeconds); // 1s
        assert_eq!(policy.release_delay(4), ReleaseDelay::TenSeconds); // 8s
        assert_eq!(policy.release_delay(5), ReleaseDelay::OneMinute); // 16s
        assert_eq!(policy.release_delay(7), ReleaseDelay::TenMinutes); // 64s
        assert_eq!(policy.release_delay(11), ReleaseDelay::OneHour); // 1024s
        assert_eq!(policy.release_delay(40), ReleaseDelay::OneHour);
    }

    #[test]
    fn schedule_rounds_to_next_bucket() {
        let policy = RetryPolicy::scheduled([
            Duration::ZERO,
            Duration::from_secs(45),
            Duration::from_secs(10_000),
        ])
        .unwrap();

        assert_eq!(policy.release_delay(1), ReleaseDelay::None);
        assert_eq!(policy.release_delay(2), ReleaseDelay::OneMinute);
        assert_eq!(policy.release_delay(3), ReleaseDelay::OneHour);
    }

    #[test]
    fn schedule_repeats_last_entry() {
        let policy = RetryPolicy::builder()
            .delays([Duration::from_secs(10), Duration::from_secs(600)])
            .build()
            .unwrap();

        assert_eq!(policy.intended_delay(0), Duration::from_secs(10));
        assert_eq!(policy.intended_delay(2), Duration::from_secs(600));
        assert_eq!(policy.intended_delay(100), Duration::from_secs(600));
        assert_eq!(policy.intended_delay(u32::MAX), Duration::from_secs(600));
    }

    #[test]
    fn empty_schedule_is_rejected() {
        assert!(matches!(
            RetryPolicy::builder().build(),
            Err(RuntimeError::Config(_))
        ));
        assert!(RetryPolicy::scheduled(Vec::new()).is_err());
    }

    proptest! {
        #[test]
        fn exponential_delay_is_monotonic(d in 0_u32..200) {
            let policy = RetryPolicy::exponential();
            prop_assert!(policy.intended_delay(d + 1) >= policy.intended_delay(d));
            prop_assert!(policy.release_delay(d + 1) >= policy.release_delay(d));
        }

        #[test]
        fn ascending_schedule_is_monotonic(
            mut secs in proptest::collection::vec(0_u64..20_000, 1..8),
            d in 0_u32..20,
        ) {
            secs.sort_unstable();
            let policy = RetryPolicy::scheduled(secs.iter().copied().map(Duration::from_secs)).unwrap();
            prop_assert!(policy.release_delay(d + 1) >= policy.release_delay(d));
        }

        #[test]
        fn issued_delay_covers_intended_up_to_an_hour(d in 0_u32..64) {
            let policy = RetryPolicy::exponential();
            let intended = policy.intended_delay(d);
            let issued = policy.release_delay(d).as_duration();
            prop_assert!(issued >= intended || issued == ReleaseDelay::OneHour.as_duration());
        }
    }
}
