//! Injectable time sources.

use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;

/// A monotonic time source, in seconds from an arbitrary origin.
///
/// Production code uses [`TokioClock`]; tests inject [`ManualClock`] to
/// make accrual and wait math deterministic.
pub trait Clock: Send + Sync + 'static {
    /// The current time.
    fn now(&self) -> f64;

    /// Sleep for `seconds`, which may be zero or negative (both resolve
    /// promptly).
    fn sleep(&self, seconds: f64) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// The default clock, backed by the tokio timer.
#[derive(Debug)]
pub struct TokioClock {
    origin: tokio::time::Instant,
}

impl TokioClock {
    pub fn new() -> Self {
        Self {
            origin: tokio::time::Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }

    fn sleep(&self, seconds: f64) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        let duration = if seconds.is_finite() && seconds > 0.0 {
            Duration::from_secs_f64(seconds.min(1e9))
        } else {
            Duration::ZERO
        };
        Box::pin(tokio::time::sleep(duration))
    }
}

/// A manually-advanced clock for tests.
///
/// Time only moves when [`set_now`](ManualClock::set_now) or
/// [`advance`](ManualClock::advance) is called; sleepers wake once the
/// clock reaches their deadline.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<f64>,
    changed: Notify,
}

impl ManualClock {
    pub fn new(start: f64) -> Self {
        Self {
            now: Mutex::new(start),
            changed: Notify::new(),
        }
    }

    /// Move the clock to `now`. Time never moves backwards.
    pub fn set_now(&self, now: f64) {
        {
            let mut current = self.now.lock().unwrap();
            assert!(now >= *current, "manual clock moved backwards");
            *current = now;
        }
        self.changed.notify_waiters();
    }

    /// Advance the clock by `seconds`.
    pub fn advance(&self, seconds: f64) {
        let target = self.now() + seconds;
        self.set_now(target);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        *self.now.lock().unwrap()
    }

    fn sleep(&self, seconds: f64) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        let target = self.now() + seconds.max(0.0);
        Box::pin(async move {
            loop {
                let changed = self.changed.notified();
                if self.now() >= target {
                    return;
                }
                changed.await;
            }
        })
    }
}
