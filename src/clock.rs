use chrono::NaiveDate;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Time source for the step test schedule and the autostart wall-clock date.
///
/// - now(): monotonic instant used to anchor sampling schedules
/// - sleep(): suspends the caller (implementations may simulate)
/// - today(): local calendar date
pub trait Clock {
    fn now(&self) -> Instant;
    fn sleep(&self, d: Duration);
    fn today(&self) -> NaiveDate;

    /// Time elapsed since `epoch`, saturating at zero.
    fn since(&self, epoch: Instant) -> Duration {
        self.now().saturating_duration_since(epoch)
    }
}

/// Real clock backed by [`Instant`] and the local time zone.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    #[inline]
    fn now(&self) -> Instant {
        Instant::now()
    }

    #[inline]
    fn sleep(&self, d: Duration) {
        if d.is_zero() {
            return;
        }
        thread::sleep(d);
    }

    fn today(&self) -> NaiveDate {
        chrono::Local::now().date_naive()
    }
}

/// Deterministic clock whose time only moves when slept on or advanced.
///
/// now() = origin + offset; sleep(d) advances the offset without blocking.
#[derive(Debug, Clone)]
pub struct ManualClock {
    origin: Instant,
    offset: Arc<Mutex<Duration>>,
    today: NaiveDate,
}

impl ManualClock {
    pub fn new(today: NaiveDate) -> Self {
        Self {
            origin: Instant::now(),
            offset: Arc::new(Mutex::new(Duration::ZERO)),
            today,
        }
    }

    /// Advance the clock by `d`, e.g. to model time spent inside a register call.
    pub fn advance(&self, d: Duration) {
        if let Ok(mut off) = self.offset.lock() {
            *off = off.saturating_add(d);
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.offset.lock().map(|g| *g).unwrap_or(Duration::ZERO)
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + self.elapsed()
    }

    fn sleep(&self, d: Duration) {
        self.advance(d);
    }

    fn today(&self) -> NaiveDate {
        self.today
    }
}
