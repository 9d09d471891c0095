//! Reconnection policies decide how long the control connection waits
//! between failed attempts to re-establish itself.
//!
//! A [`ReconnectionPolicy`] is stateless and shared. Every reconnect sequence
//! asks it for a fresh [`ReconnectionSchedule`], a cursor which is advanced on
//! each failed attempt and dropped once the connection is back.

use std::fmt::Debug;
use std::time::Duration;

/// Produces reconnection schedules.
pub trait ReconnectionPolicy: Debug + Send + Sync {
    /// Starts a new sequence of delays.
    fn new_schedule(&self) -> Box<dyn ReconnectionSchedule>;
}

/// A sequence of delays between consecutive reconnection attempts.
pub trait ReconnectionSchedule: Send + Sync {
    /// Delay before the next attempt. Called once per failed attempt.
    fn next_delay(&mut self) -> Duration;
}

/// Waits the same amount of time between every attempt.
#[derive(Debug, Clone, Copy)]
pub struct ConstantReconnectionPolicy {
    delay: Duration,
}

impl ConstantReconnectionPolicy {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl ReconnectionPolicy for ConstantReconnectionPolicy {
    fn new_schedule(&self) -> Box<dyn ReconnectionSchedule> {
        Box::new(ConstantSchedule { delay: self.delay })
    }
}

struct ConstantSchedule {
    delay: Duration,
}

impl ReconnectionSchedule for ConstantSchedule {
    fn next_delay(&mut self) -> Duration {
        self.delay
    }
}

/// Doubles the delay after every attempt, starting at `base_delay`
/// and never exceeding `max_delay`.
#[derive(Debug, Clone, Copy)]
pub struct ExponentialReconnectionPolicy {
    base_delay: Duration,
    max_delay: Duration,
}

impl ExponentialReconnectionPolicy {
    const BACKOFF_MULTIPLIER: u32 = 2;

    /// `max_delay` lower than `base_delay` is raised to `base_delay`.
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay: max_delay.max(base_delay),
        }
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }
}

impl Default for ExponentialReconnectionPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(10 * 60))
    }
}

impl ReconnectionPolicy for ExponentialReconnectionPolicy {
    fn new_schedule(&self) -> Box<dyn ReconnectionSchedule> {
        Box::new(ExponentialSchedule {
            next: self.base_delay,
            max: self.max_delay,
        })
    }
}

struct ExponentialSchedule {
    next: Duration,
    max: Duration,
}

impl ReconnectionSchedule for ExponentialSchedule {
    fn next_delay(&mut self) -> Duration {
        let current = self.next;
        self.next = self
            .next
            .checked_mul(ExponentialReconnectionPolicy::BACKOFF_MULTIPLIER)
            .map_or(self.max, |doubled| doubled.min(self.max));
        current
    }
}

/// Walks a fixed list of delays, then keeps repeating the last one.
#[derive(Debug, Clone)]
pub struct FixedReconnectionPolicy {
    delays: Vec<Duration>,
}

impl FixedReconnectionPolicy {
    /// Returns `None` if `delays` is empty.
    pub fn new(delays: Vec<Duration>) -> Option<Self> {
        (!delays.is_empty()).then_some(Self { delays })
    }
}

impl ReconnectionPolicy for FixedReconnectionPolicy {
    fn new_schedule(&self) -> Box<dyn ReconnectionSchedule> {
        Box::new(FixedSchedule {
            delays: self.delays.clone(),
            index: 0,
        })
    }
}

struct FixedSchedule {
    delays: Vec<Duration>,
    index: usize,
}

impl ReconnectionSchedule for FixedSchedule {
    fn next_delay(&mut self) -> Duration {
        let delay = self.delays[self.index.min(self.delays.len() - 1)];
        self.index = self.index.saturating_add(1);
        delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn take(policy: &dyn ReconnectionPolicy, n: usize) -> Vec<u64> {
        let mut schedule = policy.new_schedule();
        (0..n)
            .map(|_| schedule.next_delay().as_millis() as u64)
            .collect()
    }

    #[test]
    fn exponential_schedule_doubles_up_to_max() {
        let policy =
            ExponentialReconnectionPolicy::new(Duration::from_millis(100), Duration::from_secs(1));
        assert_eq!(take(&policy, 6), vec![100, 200, 400, 800, 1000, 1000]);

        // Each sequence starts over.
        assert_eq!(take(&policy, 2), vec![100, 200]);
    }

    #[test]
    fn exponential_schedule_does_not_overflow() {
        let policy = ExponentialReconnectionPolicy::new(Duration::MAX / 3, Duration::MAX);
        let mut schedule = policy.new_schedule();
        for _ in 0..5 {
            assert!(schedule.next_delay() >= Duration::MAX / 3);
        }
    }

    #[test]
    fn constant_and_fixed_schedules() {
        let constant = ConstantReconnectionPolicy::new(Duration::from_millis(50));
        assert_eq!(take(&constant, 3), vec![50, 50, 50]);

        assert!(FixedReconnectionPolicy::new(Vec::new()).is_none());
        let fixed = FixedReconnectionPolicy::new(vec![
            Duration::from_millis(10),
            Duration::from_millis(30),
        ])
        .unwrap();
        assert_eq!(take(&fixed, 4), vec![10, 30, 30, 30]);
    }
}
