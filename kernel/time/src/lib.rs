//! Delay sources and bounded polling.
//!
//! Drivers never spin on a hardware bit forever. Every wait goes through
//! [`poll_until`], which gives up after a fixed number of attempts
//! and reports a [`PollTimeout`] that the driver turns into its own error.
//!
//! The time source is injected via the [`Delay`] trait, so tests can
//! substitute a counting delay that doesn't actually wait.

#![cfg_attr(not(test), no_std)]

#[macro_use] extern crate log;

pub use core::time::Duration;

/// A source of short, blocking delays.
pub trait Delay: Send + Sync {
    /// Blocks the caller for at least `duration`.
    fn delay(&self, duration: Duration);
}

/// A [`Delay`] that busy-waits on a monotonic clock function,
/// e.g., one backed by the TSC or HPET.
pub struct MonotonicDelay {
    now: fn() -> Duration,
}

impl MonotonicDelay {
    /// Creates a delay source that reads the current time from `now`.
    pub const fn new(now: fn() -> Duration) -> MonotonicDelay {
        MonotonicDelay { now }
    }
}

impl Delay for MonotonicDelay {
    fn delay(&self, duration: Duration) {
        let start = (self.now)();
        while (self.now)().saturating_sub(start) < duration {
            core::hint::spin_loop();
        }
    }
}

/// How many times to poll a condition, and how long to wait between polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    /// The maximum number of times the condition is checked.
    pub max_attempts: u32,
    /// The delay between two consecutive checks.
    pub interval: Duration,
}

impl PollPolicy {
    pub const fn new(max_attempts: u32, interval: Duration) -> PollPolicy {
        PollPolicy { max_attempts, interval }
    }

    /// The longest time a poll with this policy can take, ignoring the cost of the checks themselves.
    pub fn budget(&self) -> Duration {
        self.interval.saturating_mul(self.max_attempts)
    }
}

impl Default for PollPolicy {
    fn default() -> PollPolicy {
        PollPolicy::new(10_000, Duration::from_micros(1))
    }
}

/// The condition passed to [`poll_until`] never became ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
#[display(fmt = "condition not met after {} attempts", attempts)]
pub struct PollTimeout {
    /// How many times the condition was checked.
    pub attempts: u32,
}

/// Repeatedly evaluates `condition` until it returns `Some`,
/// waiting `policy.interval` between attempts.
///
/// Returns the value produced by `condition`,
/// or a [`PollTimeout`] once `policy.max_attempts` checks have failed.
pub fn poll_until<T, F>(policy: &PollPolicy, delay: &dyn Delay, mut condition: F) -> Result<T, PollTimeout>
where
    F: FnMut() -> Option<T>,
{
    for attempt in 0..policy.max_attempts {
        if let Some(value) = condition() {
            if attempt > 0 {
                trace!("poll_until(): condition met after {} attempts", attempt + 1);
            }
            return Ok(value);
        }
        delay.delay(policy.interval);
    }
    Err(PollTimeout { attempts: policy.max_attempts })
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct CountingDelay {
        calls: AtomicU32,
    }

    impl Delay for CountingDelay {
        fn delay(&self, _duration: Duration) {
            self.calls.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn ready_condition_does_not_wait() {
        let delay = CountingDelay::default();
        let value = poll_until(&PollPolicy::default(), &delay, || Some(7u16));
        assert_eq!(value, Ok(7));
        assert_eq!(delay.calls.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn condition_met_after_a_few_polls() {
        let delay = CountingDelay::default();
        let mut remaining = 3;
        let value = poll_until(&PollPolicy::new(10, Duration::from_micros(5)), &delay, || {
            if remaining == 0 {
                Some("done")
            } else {
                remaining -= 1;
                None
            }
        });
        assert_eq!(value, Ok("done"));
        assert_eq!(delay.calls.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn exhausted_policy_times_out() {
        let delay = CountingDelay::default();
        let result: Result<(), _> = poll_until(&PollPolicy::new(4, Duration::from_micros(1)), &delay, || None);
        assert_eq!(result, Err(PollTimeout { attempts: 4 }));
        assert_eq!(delay.calls.load(Ordering::Relaxed), 4);
    }

    #[test]
    fn budget_is_attempts_times_interval() {
        let policy = PollPolicy::new(250, Duration::from_micros(4));
        assert_eq!(policy.budget(), Duration::from_millis(1));
    }
}
