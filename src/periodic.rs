use std::thread;
use std::time::{Duration, Instant};

/// Fixed-period wake schedule with absolute deadlines.
///
/// Deadlines advance by exactly one period per tick, so time spent inside a
/// tick does not stretch the period. A tick that overruns its deadline is
/// reported as a miss and the schedule restarts from now instead of firing
/// a burst of catch-up ticks.
#[derive(Debug)]
pub struct Pacer {
    period: Duration,
    next: Instant,
}

impl Pacer {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            next: Instant::now() + period,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Time left until the next deadline, or `None` if it already passed.
    /// Advances the schedule either way.
    pub fn advance(&mut self, now: Instant) -> Option<Duration> {
        let deadline = self.next;
        if now < deadline {
            self.next = deadline + self.period;
            Some(deadline - now)
        } else {
            self.next = now + self.period;
            None
        }
    }

    /// Sleep until the next deadline. Returns `false` on a missed deadline.
    pub fn wait(&mut self) -> bool {
        match self.advance(Instant::now()) {
            Some(remaining) => {
                thread::sleep(remaining);
                true
            }
            None => false,
        }
    }

    /// Like `wait`, but parks so that `Thread::unpark` can cut the sleep
    /// short. Spurious wakeups are absorbed by the caller re-checking its
    /// stop flag.
    pub fn park(&mut self) -> bool {
        match self.advance(Instant::now()) {
            Some(remaining) => {
                thread::park_timeout(remaining);
                true
            }
            None => false,
        }
    }
}

/// Counts missed deadlines and says when to complain about them.
#[derive(Debug)]
pub struct MissCounter {
    misses: u32,
    threshold: u32,
}

impl MissCounter {
    pub fn new(threshold: u32) -> Self {
        Self {
            misses: 0,
            threshold: threshold.max(1),
        }
    }

    /// Record one tick. Returns `true` (and resets) when misses reach the
    /// threshold.
    pub fn record(&mut self, on_time: bool) -> bool {
        if on_time {
            return false;
        }

        self.misses += 1;
        if self.misses >= self.threshold {
            self.misses = 0;
            true
        } else {
            false
        }
    }

    pub fn misses(&self) -> u32 {
        self.misses
    }
}
