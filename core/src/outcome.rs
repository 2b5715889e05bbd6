//! Dispatch outcomes.
//!
//! Every pulled event ends in exactly one [`Outcome`]: acknowledge on success,
//! release for a later retry on a transient failure, reject on a permanent one.

use crate::event::LockToken;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Release delays the broker accepts.
///
/// The broker only supports this discrete ladder; any intended delay is rounded
/// up to the next rung with [`ReleaseDelay::at_least`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ReleaseDelay {
    /// Redeliver immediately.
    #[default]
    None,
    /// Redeliver after 10 seconds.
    TenSeconds,
    /// Redeliver after 1 minute.
    OneMinute,
    /// Redeliver after 10 minutes.
    TenMinutes,
    /// Redeliver after 1 hour.
    OneHour,
}

impl ReleaseDelay {
    /// All supported delays, ascending.
    pub const ALL: [Self; 5] = [
        Self::None,
        Self::TenSeconds,
        Self::OneMinute,
        Self::TenMinutes,
        Self::OneHour,
    ];

    /// Delay in whole seconds.
    #[must_use]
    pub const fn as_secs(self) -> u64 {
        match self {
            Self::None => 0,
            Self::TenSeconds => 10,
            Self::OneMinute => 60,
            Self::TenMinutes => 600,
            Self::OneHour => 3600,
        }
    }

    /// Delay as a [`Duration`].
    #[must_use]
    pub const fn as_duration(self) -> Duration {
        Duration::from_secs(self.as_secs())
    }

    /// Smallest supported delay `>= intended`, or the largest one if `intended`
    /// exceeds them all.
    #[must_use]
    pub fn at_least(intended: Duration) -> Self {
        Self::ALL
            .into_iter()
            .find(|delay| delay.as_duration() >= intended)
            .unwrap_or(Self::OneHour)
    }
}

impl fmt::Display for ReleaseDelay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}s", self.as_secs())
    }
}

/// How an event is settled with the broker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OutcomeKind {
    /// Processed successfully.
    Acknowledge,
    /// Transient failure; redeliver after `delay`.
    Release {
        /// Delay before redelivery
        delay: ReleaseDelay,
    },
    /// Permanent failure; never deliver again.
    Reject,
}

impl OutcomeKind {
    /// Short label used in logs and metrics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Acknowledge => "acknowledge",
            Self::Release { .. } => "release",
            Self::Reject => "reject",
        }
    }
}

impl fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Release { delay } => write!(f, "release({delay})"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Result of dispatching one event bundle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Outcome {
    /// Lease to settle.
    pub lock_token: LockToken,
    /// Classification.
    pub kind: OutcomeKind,
}

impl Outcome {
    /// Successful dispatch.
    #[must_use]
    pub const fn acknowledge(lock_token: LockToken) -> Self {
        Self {
            lock_token,
            kind: OutcomeKind::Acknowledge,
        }
    }

    /// Transient failure.
    #[must_use]
    pub const fn release(lock_token: LockToken, delay: ReleaseDelay) -> Self {
        Self {
            lock_token,
            kind: OutcomeKind::Release { delay },
        }
    }

    /// Permanent failure.
    #[must_use]
    pub const fn reject(lock_token: LockToken) -> Self {
        Self {
            lock_token,
            kind: OutcomeKind::Reject,
        }
    }
}
