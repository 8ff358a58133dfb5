//! Reproduces the original inter-message timing of a capture.
//!
//! The pacer is anchored on the first message at or after `start_after`: that
//! message is sent at once and every later one is scheduled relative to it,
//! with historical gaps divided by the replay speed.
use crate::itch::Timestamp;
use std::time::{Duration, Instant};

/// Source of monotonic time.
pub trait Clock {
    fn now(&self) -> Instant;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

#[derive(Debug, Clone, Copy)]
struct Epoch {
    wall: Instant,
    message: Timestamp,
}

pub struct ReplayPacer<C: Clock = MonotonicClock> {
    time_scale: f64,
    start_after: Timestamp,
    epoch: Option<Epoch>,
    clock: C,
}

impl ReplayPacer<MonotonicClock> {
    pub fn new(time_scale: f64, start_after: Timestamp) -> Self {
        Self::with_clock(time_scale, start_after, MonotonicClock)
    }
}

impl<C: Clock> ReplayPacer<C> {
    pub fn with_clock(time_scale: f64, start_after: Timestamp, clock: C) -> Self {
        Self {
            time_scale,
            start_after,
            epoch: None,
            clock,
        }
    }

    /// How long to wait before sending a packet stamped `timestamp`.
    ///
    /// `None` means the packet precedes the start phase and must not be sent.
    pub fn get_delay(&mut self, timestamp: Timestamp) -> Option<Duration> {
        if timestamp < self.start_after {
            return None;
        }
        let Some(epoch) = self.epoch else {
            self.epoch = Some(Epoch {
                wall: self.clock.now(),
                message: timestamp,
            });
            return Some(Duration::ZERO);
        };

        let elapsed = timestamp.saturating_since(epoch.message);
        let scaled = self.scale(elapsed);
        let now = self.clock.now();
        Some(
            epoch
                .wall
                .checked_add(scaled)
                .map_or(scaled, |target| target.saturating_duration_since(now)),
        )
    }

    /// Whether the pacing epoch has been fixed.
    pub fn started(&self) -> bool {
        self.epoch.is_some()
    }

    fn scale(&self, elapsed: Duration) -> Duration {
        if self.time_scale == 1.0 {
            return elapsed;
        }
        let nanos = elapsed.as_nanos() as f64 / self.time_scale;
        if nanos.is_finite() {
            Duration::from_nanos(nanos as u64)
        } else {
            Duration::MAX
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[derive(Clone)]
    struct ManualClock(Rc<Cell<Instant>>);

    impl ManualClock {
        fn new() -> Self {
            ManualClock(Rc::new(Cell::new(Instant::now())))
        }

        fn advance(&self, by: Duration) {
            self.0.set(self.0.get() + by);
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> Instant {
            self.0.get()
        }
    }

    fn ms(v: u64) -> Timestamp {
        Timestamp::from_duration(Duration::from_millis(v)).unwrap()
    }

    fn pacer(scale: f64) -> (ReplayPacer<ManualClock>, ManualClock) {
        let clock = ManualClock::new();
        (ReplayPacer::with_clock(scale, ms(100), clock.clone()), clock)
    }

    #[test]
    fn suppresses_before_start_after() {
        let (mut pacer, _) = pacer(1.0);
        assert_eq!(pacer.get_delay(ms(50)), None);
        assert!(!pacer.started());
    }

    #[test]
    fn first_in_window_establishes_epoch() {
        let (mut pacer, _) = pacer(1.0);
        assert_eq!(pacer.get_delay(ms(150)), Some(Duration::ZERO));
        assert!(pacer.started());
    }

    #[test]
    fn normal_speed_subtracts_elapsed_wall_time() {
        let (mut pacer, clock) = pacer(1.0);
        pacer.get_delay(ms(150));
        clock.advance(Duration::from_millis(5));
        assert_eq!(pacer.get_delay(ms(350)), Some(Duration::from_millis(195)));
    }

    #[test]
    fn double_speed_halves_gap() {
        let (mut pacer, clock) = pacer(2.0);
        pacer.get_delay(ms(150));
        clock.advance(Duration::from_millis(5));
        assert_eq!(pacer.get_delay(ms(350)), Some(Duration::from_millis(95)));
    }

    #[test]
    fn lagging_behind_yields_zero() {
        let (mut pacer, clock) = pacer(1.0);
        pacer.get_delay(ms(150));
        clock.advance(Duration::from_millis(500));
        assert_eq!(pacer.get_delay(ms(350)), Some(Duration::ZERO));
    }

    #[test]
    fn epoch_ignores_suppressed_prefix() {
        let (mut pacer, clock) = pacer(1.0);
        assert_eq!(pacer.get_delay(ms(10)), None);
        assert_eq!(pacer.get_delay(ms(99)), None);
        clock.advance(Duration::from_secs(3));
        assert_eq!(pacer.get_delay(ms(100)), Some(Duration::ZERO));
        assert_eq!(pacer.get_delay(ms(110)), Some(Duration::from_millis(10)));
    }
}
