//! Resend-until-acknowledged timers
//!
//! Introduction and puncture requests are unreliable; a [`RetryTimer`]
//! keeps resending until the peer answers, the caller cancels, or a
//! bounded timer runs out of iterations. The timer is a poll-driven state
//! machine: callers pass explicit instants, so tests drive it without
//! sleeping.

use log::debug;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::address::Address;

/// What the caller should do after polling a timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerAction {
    /// Invoke the resend now; the timer has re-armed (or stopped, when
    /// this firing exhausted a bounded timer; poll again to find out).
    Fire,
    /// Nothing due yet; check again after this long.
    Wait(Duration),
    /// Acknowledged, cancelled or exhausted.
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerState {
    Armed,
    Stopped,
}

/// Periodic or bounded resend timer.
#[derive(Debug)]
pub struct RetryTimer {
    period: Duration,
    /// None: fire forever until acknowledged/cancelled.
    max_iterations: Option<u32>,
    iterations: u32,
    armed_at: Instant,
    state: TimerState,
}

impl RetryTimer {
    /// Fires every `period` until acknowledged or cancelled.
    pub fn periodic(period: Duration, now: Instant) -> Self {
        Self {
            period,
            max_iterations: None,
            iterations: 0,
            armed_at: now,
            state: TimerState::Armed,
        }
    }

    /// Fires every `period` at most `max_iterations` times.
    pub fn bounded(period: Duration, max_iterations: u32, now: Instant) -> Self {
        Self {
            period,
            max_iterations: Some(max_iterations),
            iterations: 0,
            armed_at: now,
            state: TimerState::Armed,
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.state == TimerState::Stopped
    }

    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    /// The awaited acknowledgment arrived.
    pub fn acknowledge(&mut self) {
        self.state = TimerState::Stopped;
    }

    /// Caller gave up.
    pub fn cancel(&mut self) {
        self.state = TimerState::Stopped;
    }

    /// Advance the state machine to `now`.
    pub fn poll(&mut self, now: Instant) -> TimerAction {
        if self.state == TimerState::Stopped {
            return TimerAction::Stopped;
        }
        if let Some(max) = self.max_iterations {
            if self.iterations >= max {
                self.state = TimerState::Stopped;
                return TimerAction::Stopped;
            }
        }
        let elapsed = now.duration_since(self.armed_at);
        if elapsed < self.period {
            return TimerAction::Wait(self.period - elapsed);
        }
        self.iterations += 1;
        self.armed_at = now;
        if self.max_iterations == Some(self.iterations) {
            // Final allowed firing; next poll reports Stopped.
            debug!("retry timer exhausted after {} iterations", self.iterations);
        }
        TimerAction::Fire
    }
}

/// Retry timers keyed by the candidate address they chase, swept as one.
#[derive(Debug, Default)]
pub struct RetryScheduler {
    timers: HashMap<Address, RetryTimer>,
}

impl RetryScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    /// Arm a timer for `addr`, replacing any previous one.
    pub fn arm(&mut self, addr: Address, timer: RetryTimer) {
        self.timers.insert(addr, timer);
    }

    pub fn contains(&self, addr: &Address) -> bool {
        self.timers.contains_key(addr)
    }

    /// Acknowledgment observed for `addr`; its timer stops.
    pub fn acknowledge(&mut self, addr: &Address) {
        if let Some(timer) = self.timers.get_mut(addr) {
            timer.acknowledge();
        }
    }

    pub fn cancel(&mut self, addr: &Address) {
        if let Some(timer) = self.timers.get_mut(addr) {
            timer.cancel();
        }
    }

    /// Poll every timer, dropping the stopped ones. Returns the addresses
    /// whose resend callbacks are due now.
    pub fn sweep(&mut self, now: Instant) -> Vec<Address> {
        let mut due = Vec::new();
        self.timers.retain(|addr, timer| match timer.poll(now) {
            TimerAction::Fire => {
                due.push(addr.clone());
                true
            }
            TimerAction::Wait(_) => true,
            TimerAction::Stopped => false,
        });
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn test_periodic_rearms_until_acknowledged() {
        let t0 = Instant::now();
        let mut timer = RetryTimer::periodic(secs(5), t0);

        assert_eq!(timer.poll(t0 + secs(1)), TimerAction::Wait(secs(4)));
        assert_eq!(timer.poll(t0 + secs(5)), TimerAction::Fire);
        // Re-armed from the firing instant.
        assert_eq!(timer.poll(t0 + secs(6)), TimerAction::Wait(secs(4)));
        assert_eq!(timer.poll(t0 + secs(10)), TimerAction::Fire);

        timer.acknowledge();
        assert_eq!(timer.poll(t0 + secs(100)), TimerAction::Stopped);
    }

    #[test]
    fn test_bounded_exhausts() {
        let t0 = Instant::now();
        let mut timer = RetryTimer::bounded(secs(1), 2, t0);

        assert_eq!(timer.poll(t0 + secs(1)), TimerAction::Fire);
        assert_eq!(timer.poll(t0 + secs(2)), TimerAction::Fire);
        assert_eq!(timer.iterations(), 2);
        assert_eq!(timer.poll(t0 + secs(3)), TimerAction::Stopped);
        assert!(timer.is_stopped());
    }

    #[test]
    fn test_cancel_stops_immediately() {
        let t0 = Instant::now();
        let mut timer = RetryTimer::bounded(secs(1), 10, t0);
        timer.cancel();
        assert_eq!(timer.poll(t0 + secs(5)), TimerAction::Stopped);
    }

    #[test]
    fn test_scheduler_sweep_and_drop() {
        let t0 = Instant::now();
        let a = Address::parse("1.1.1.1:1");
        let b = Address::parse("2.2.2.2:2");
        let mut sched = RetryScheduler::new();
        sched.arm(a.clone(), RetryTimer::periodic(secs(1), t0));
        sched.arm(b.clone(), RetryTimer::bounded(secs(1), 1, t0));

        let mut due = sched.sweep(t0 + secs(1));
        due.sort();
        let mut expected = vec![a.clone(), b.clone()];
        expected.sort();
        assert_eq!(due, expected);

        // b exhausted its single iteration, a keeps going.
        assert_eq!(sched.sweep(t0 + secs(2)), vec![a.clone()]);
        assert_eq!(sched.len(), 1);

        sched.acknowledge(&a);
        assert!(sched.sweep(t0 + secs(3)).is_empty());
        assert!(sched.is_empty());
    }
}
