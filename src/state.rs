//! State shared between the real-time tasks and the command handler.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, TryLockError};
use std::thread;
use std::time::{Duration, Instant};

/// Try to take `mutex` for at most `wait`. A poisoned lock still yields its
/// data; the heading is a plain `f32`, so there is no invariant to break.
pub fn lock_within<T: ?Sized>(mutex: &Mutex<T>, wait: Duration) -> Option<MutexGuard<'_, T>> {
    let deadline = Instant::now() + wait;

    loop {
        match mutex.try_lock() {
            Ok(guard) => return Some(guard),
            Err(TryLockError::Poisoned(poisoned)) => return Some(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => {
                if Instant::now() >= deadline {
                    return None;
                }
                thread::yield_now();
            }
        }
    }
}

/// `f32` stored as its bit pattern.
#[derive(Debug, Default)]
pub struct AtomicF32(AtomicU32);

impl AtomicF32 {
    pub fn new(value: f32) -> Self {
        Self(AtomicU32::new(value.to_bits()))
    }

    pub fn load(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, value: f32) {
        self.0.store(value.to_bits(), Ordering::Release);
    }
}

/// Outcome of a bounded-wait heading read.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Reading {
    /// Read under the lock just now.
    Fresh(f32),
    /// The lock was busy; this is the last value successfully read.
    Stale(f32),
}

impl Reading {
    pub fn value(self) -> f32 {
        match self {
            Reading::Fresh(value) | Reading::Stale(value) => value,
        }
    }

    pub fn is_fresh(self) -> bool {
        matches!(self, Reading::Fresh(_))
    }
}

/// The published heading. One writer (the estimator), many readers.
#[derive(Debug, Default)]
pub struct HeadingCell {
    heading: Mutex<f32>,
    last_read: AtomicF32,
}

impl HeadingCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a new heading. Returns `false` when the lock could not be
    /// taken in time and this cycle's value was dropped.
    pub fn publish(&self, heading: f32, wait: Duration) -> bool {
        match lock_within(&self.heading, wait) {
            Some(mut guard) => {
                *guard = heading;
                true
            }
            None => false,
        }
    }

    /// Read the heading, never waiting longer than `wait`. Falls back to the
    /// last value read (0.0 before the first publish).
    pub fn read(&self, wait: Duration) -> Reading {
        match lock_within(&self.heading, wait) {
            Some(guard) => {
                let heading = *guard;
                drop(guard);
                self.last_read.store(heading);
                Reading::Fresh(heading)
            }
            None => Reading::Stale(self.last_read.load()),
        }
    }

    /// Hold the lock for `hold`. Test hook for contention.
    #[cfg(test)]
    pub(crate) fn hold_for(&self, hold: Duration) {
        let _guard = self.heading.lock();
        thread::sleep(hold);
    }
}

/// Anchoring flags written by the command handler and read by the tasks.
#[derive(Debug, Default)]
pub struct AnchorState {
    anchoring: AtomicBool,
    yaw_anchor: AtomicF32,
}

impl AnchorState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_anchoring(&self) -> bool {
        self.anchoring.load(Ordering::Acquire)
    }

    pub fn set_anchoring(&self, anchoring: bool) {
        self.anchoring.store(anchoring, Ordering::Release);
    }

    pub fn yaw_anchor(&self) -> f32 {
        self.yaw_anchor.load()
    }

    pub fn set_yaw_anchor(&self, anchor: f32) {
        self.yaw_anchor.store(anchor);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const WAIT: Duration = Duration::from_millis(10);

    #[test]
    fn test_publish_then_read() {
        let cell = HeadingCell::new();
        assert_eq!(cell.read(WAIT), Reading::Fresh(0.0));

        assert!(cell.publish(123.5, WAIT));
        assert_eq!(cell.read(WAIT), Reading::Fresh(123.5));
    }

    #[test]
    fn test_read_under_contention_is_bounded_and_stale() {
        let cell = Arc::new(HeadingCell::new());
        cell.publish(42.0, WAIT);
        cell.read(WAIT);

        let holder = {
            let cell = Arc::clone(&cell);
            thread::spawn(move || cell.hold_for(Duration::from_millis(300)))
        };
        thread::sleep(Duration::from_millis(50));

        let started = Instant::now();
        let reading = cell.read(WAIT);
        let waited = started.elapsed();

        assert_eq!(reading, Reading::Stale(42.0));
        assert!(reading.value().is_finite());
        assert!(waited < Duration::from_millis(150), "waited {waited:?}");

        // publishing is skipped rather than blocking
        assert!(!cell.publish(50.0, WAIT));

        holder.join().unwrap();
        assert_eq!(cell.read(WAIT), Reading::Fresh(42.0));
    }

    #[test]
    fn test_stale_before_any_read_is_zero() {
        let cell = Arc::new(HeadingCell::new());
        cell.publish(90.0, WAIT);

        let holder = {
            let cell = Arc::clone(&cell);
            thread::spawn(move || cell.hold_for(Duration::from_millis(200)))
        };
        thread::sleep(Duration::from_millis(50));

        assert_eq!(cell.read(WAIT), Reading::Stale(0.0));
        holder.join().unwrap();
    }

    #[test]
    fn test_atomic_f32() {
        let value = AtomicF32::new(1.25);
        assert_eq!(value.load(), 1.25);
        value.store(-7.5);
        assert_eq!(value.load(), -7.5);
    }

    #[test]
    fn test_anchor_state() {
        let state = AnchorState::new();
        assert!(!state.is_anchoring());
        state.set_anchoring(true);
        state.set_yaw_anchor(271.0);
        assert!(state.is_anchoring());
        assert_eq!(state.yaw_anchor(), 271.0);
    }
}
