//! Deadline-driven one-shot timers (§4.G).
//!
//! The core runs on a single-threaded cooperative execution context (§5):
//! there is no background thread here. A [`Scheduler`] just tracks armed
//! deadlines; the caller is responsible for calling [`Scheduler::poll`] from
//! its own event loop (a substrate-receive callback, a harness tick, or a
//! test driving time forward manually) and running the callbacks it
//! returns. This mirrors the teacher's `quanta::Instant`-based timestamping
//! in `pool.rs`/`stats.rs`, generalized into a tiny reactor instead of a
//! single clock read.

use quanta::{Clock, Instant};
use slab::Slab;
use std::time::Duration;

/// A handle to an armed timer. Dropping this handle does *not* cancel the
/// timer on its own — call [`Scheduler::cancel`] explicitly. A bare `usize`
/// index is deliberately used rather than an RAII guard: cache slots (§4.B)
/// hold at most one handle and cancel it explicitly when superseded, per
/// Design Notes §9.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(usize);

struct Armed<T> {
    deadline: Instant,
    payload: T,
}

/// A minimal single-threaded timer wheel. `T` is an opaque payload returned
/// by `poll` when a deadline fires — callers typically use an enum
/// identifying which logical timer (repair, do-repair, name-discovery,
/// session-announce, ...) just expired.
pub struct Scheduler<T> {
    clock: Clock,
    armed: Slab<Armed<T>>,
}

impl<T> Scheduler<T> {
    pub fn new() -> Self {
        Scheduler {
            clock: Clock::new(),
            armed: Slab::new(),
        }
    }

    /// Construct a scheduler driven by an explicit [`Clock`] — used with
    /// [`Clock::mock`] for deterministic tests and benchmarks that need
    /// to fast-forward past real deadlines without sleeping.
    pub(crate) fn with_clock(clock: Clock) -> Self {
        Scheduler {
            clock,
            armed: Slab::new(),
        }
    }

    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    /// Arm a new timer `delay` from now, carrying `payload`.
    pub fn schedule(&mut self, delay: Duration, payload: T) -> TimerHandle {
        let deadline = self.clock.now() + delay;
        TimerHandle(self.armed.insert(Armed { deadline, payload }))
    }

    /// Cancel a previously armed timer. A no-op if already fired or
    /// cancelled (matches the teacher's idempotent-remove pattern in
    /// `pool::PacketPool::remove`).
    pub fn cancel(&mut self, handle: TimerHandle) {
        if self.armed.contains(handle.0) {
            self.armed.remove(handle.0);
        }
    }

    pub fn is_armed(&self, handle: TimerHandle) -> bool {
        self.armed.contains(handle.0)
    }

    /// Drain every timer whose deadline has passed, returning their
    /// payloads. Callers run the associated logic themselves; this keeps
    /// the scheduler free of re-entrancy concerns (the pop-loop arbitrator
    /// in `group.rs` is the one place re-entrancy is handled explicitly).
    pub fn poll(&mut self) -> Vec<T> {
        let now = self.clock.now();
        let expired: Vec<usize> = self
            .armed
            .iter()
            .filter(|(_, a)| a.deadline <= now)
            .map(|(idx, _)| idx)
            .collect();

        let mut fired = Vec::with_capacity(expired.len());
        for idx in expired {
            fired.push(self.armed.remove(idx).payload);
        }
        fired
    }

    /// Time until the next deadline, if any armed timer exists. Lets a
    /// caller sleep/select precisely instead of busy-polling.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.armed.iter().map(|(_, a)| a.deadline).min()
    }

    pub fn len(&self) -> usize {
        self.armed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.armed.is_empty()
    }
}

impl<T> Default for Scheduler<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Sample a uniform random delay, in milliseconds, from an `(min, max)`
/// jitter range — used for repair/do-repair/whois-reply/session-announce
/// timers throughout §4.B and §4.D.
pub fn jitter_ms(range: (u64, u64)) -> Duration {
    use rand::Rng;
    let (lo, hi) = range;
    if lo >= hi {
        return Duration::from_millis(lo);
    }
    let ms = rand::rng().random_range(lo..=hi);
    Duration::from_millis(ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_and_poll_fires_after_deadline() {
        let (clock, mock) = Clock::mock();
        let mut sched: Scheduler<&'static str> = Scheduler::with_clock(clock);
        let _ = sched.schedule(Duration::from_millis(10), "a");
        assert!(sched.poll().is_empty());
        mock.increment(Duration::from_millis(11));
        assert_eq!(sched.poll(), vec!["a"]);
    }

    #[test]
    fn cancel_prevents_firing() {
        let (clock, mock) = Clock::mock();
        let mut sched: Scheduler<&'static str> = Scheduler::with_clock(clock);
        let h = sched.schedule(Duration::from_millis(5), "a");
        sched.cancel(h);
        mock.increment(Duration::from_millis(10));
        assert!(sched.poll().is_empty());
    }

    #[test]
    fn next_deadline_reports_soonest() {
        let (clock, _mock) = Clock::mock();
        let mut sched: Scheduler<&'static str> = Scheduler::with_clock(clock);
        sched.schedule(Duration::from_millis(50), "late");
        sched.schedule(Duration::from_millis(10), "soon");
        let remaining = sched.next_deadline().unwrap() - sched.now();
        assert!(remaining <= Duration::from_millis(50));
    }

    #[test]
    fn jitter_respects_range() {
        for _ in 0..100 {
            let d = jitter_ms((150, 250));
            assert!(d.as_millis() >= 150 && d.as_millis() <= 250);
        }
    }
}
