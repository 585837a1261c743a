//! Clocks and bounded polling used while waiting on the remote.
//!
//! Completion is driven by the remote asynchronously, so the host polls shared
//! memory (or the ack register) at a fixed interval until a deadline. The clock
//! is injectable: [`SystemClock`] sleeps for real, [`ManualClock`] advances
//! virtual time on every sleep so timeouts can be exercised without waiting.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Result of polling for a condition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitResult<T> {
    /// The condition produced a value before the deadline.
    Ready(T),
    /// The deadline elapsed first.
    TimedOut,
}

/// Time source and sleeper used by polling loops.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration);
}

/// Wall-clock time with real sleeps.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Virtual clock: `sleep` advances time instantly.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    elapsed_nanos: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            elapsed_nanos: AtomicU64::new(0),
        }
    }

    /// Moves virtual time forward.
    pub fn advance(&self, duration: Duration) {
        let nanos = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        self.elapsed_nanos.fetch_add(nanos, Ordering::SeqCst);
    }

    /// Virtual time elapsed since construction.
    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.elapsed_nanos.load(Ordering::SeqCst))
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + self.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}

/// Calls `probe` every `interval` until it yields a value or `timeout` elapses.
///
/// The probe always runs at least once, and once more after the final sleep,
/// so a condition satisfied right at the deadline is still observed.
pub fn poll_until<T>(
    clock: &dyn Clock,
    interval: Duration,
    timeout: Duration,
    mut probe: impl FnMut() -> Option<T>,
) -> WaitResult<T> {
    let start = clock.now();
    let deadline = start.checked_add(timeout);
    loop {
        if let Some(value) = probe() {
            return WaitResult::Ready(value);
        }
        let now = clock.now();
        if deadline.is_some_and(|deadline| now >= deadline) {
            log::trace!("poll gave up after {:?}", now.duration_since(start));
            return WaitResult::TimedOut;
        }
        clock.sleep(interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn ready_on_first_probe_does_not_sleep() {
        let clock = ManualClock::new();
        let result = poll_until(&clock, Duration::from_millis(1), Duration::ZERO, || Some(5));
        assert_eq!(result, WaitResult::Ready(5));
        assert_eq!(clock.elapsed(), Duration::ZERO);
    }

    #[test]
    fn times_out_after_deadline_in_virtual_time() {
        let clock = ManualClock::new();
        let probes = Cell::new(0u32);
        let result: WaitResult<()> = poll_until(
            &clock,
            Duration::from_millis(10),
            Duration::from_millis(50),
            || {
                probes.set(probes.get() + 1);
                None
            },
        );
        assert_eq!(result, WaitResult::TimedOut);
        assert_eq!(clock.elapsed(), Duration::from_millis(50));
        assert_eq!(probes.get(), 6, "initial probe plus one per interval");
    }

    #[test]
    fn condition_met_mid_wait() {
        let clock = ManualClock::new();
        let probes = Cell::new(0u32);
        let result = poll_until(
            &clock,
            Duration::from_millis(1),
            Duration::from_secs(1),
            || {
                probes.set(probes.get() + 1);
                (probes.get() == 4).then_some("done")
            },
        );
        assert_eq!(result, WaitResult::Ready("done"));
        assert_eq!(clock.elapsed(), Duration::from_millis(3));
    }

    #[test]
    fn system_clock_honours_short_timeouts() {
        let clock = SystemClock;
        let start = Instant::now();
        let result: WaitResult<()> = poll_until(
            &clock,
            Duration::from_millis(1),
            Duration::from_millis(5),
            || None,
        );
        assert_eq!(result, WaitResult::TimedOut);
        assert!(start.elapsed() >= Duration::from_millis(5));
    }
}
