//! Token-bucket rate limiting with a FIFO wait queue.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::{error, fmt};

use tokio::sync::{oneshot, Notify};

use super::clock::{Clock, TokioClock};

/// Configuration for a [`TokenBucket`].
///
/// `flow_rate` is the steady-state refill speed in tokens per second;
/// `max_burst_size` bounds how many tokens can be saved up. Everything
/// else is optional.
#[derive(Debug, Clone)]
pub struct TokenBucketConfig {
    flow_rate: f64,
    max_burst_size: f64,
    initial_burst_size: Option<f64>,
    max_queue_grant_size: Option<f64>,
    max_queue_size: Option<f64>,
    partial_tokens: bool,
}

impl TokenBucketConfig {
    pub fn new(flow_rate: f64, max_burst_size: f64) -> Self {
        Self {
            flow_rate,
            max_burst_size,
            initial_burst_size: None,
            max_queue_grant_size: None,
            max_queue_size: None,
            partial_tokens: false,
        }
    }

    /// Tokens available at construction. Defaults to `max_burst_size`.
    pub fn initial_burst_size(mut self, size: f64) -> Self {
        self.initial_burst_size = Some(size);
        self
    }

    /// Largest grant a *queued* waiter may receive. Defaults to
    /// `max_burst_size`, clamped to `max_queue_size` when one is set.
    pub fn max_queue_grant_size(mut self, size: f64) -> Self {
        self.max_queue_grant_size = Some(size);
        self
    }

    /// Total queued request tokens allowed at once. Default unbounded.
    pub fn max_queue_size(mut self, size: f64) -> Self {
        self.max_queue_size = Some(size);
        self
    }

    /// Whether grants may be fractional. Defaults to `false`, in which
    /// case fractional burst accrues but is never granted.
    pub fn partial_tokens(mut self, partial: bool) -> Self {
        self.partial_tokens = partial;
        self
    }
}

/// A construction-time configuration problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigError(&'static str);

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid token bucket config: {}", self.0)
    }
}

impl error::Error for ConfigError {}

/// The bounds of a grant request: inclusive minimum and maximum token
/// counts. A scalar converts to an exact range.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GrantRange {
    min: f64,
    max: f64,
}

impl GrantRange {
    /// # Panics
    ///
    /// When the bounds are not finite, negative, or inverted.
    pub fn new(min: f64, max: f64) -> Self {
        assert!(
            min.is_finite() && max.is_finite() && min >= 0.0 && max >= min,
            "invalid grant range"
        );
        Self { min, max }
    }
}

impl From<f64> for GrantRange {
    fn from(n: f64) -> Self {
        Self::new(n, n)
    }
}

impl From<u32> for GrantRange {
    fn from(n: u32) -> Self {
        Self::from(f64::from(n))
    }
}

impl From<(f64, f64)> for GrantRange {
    fn from((min, max): (f64, f64)) -> Self {
        Self::new(min, max)
    }
}

/// Why a grant request settled the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantReason {
    /// Tokens were granted.
    Grant,
    /// The wait queue had no room for the request.
    Full,
    /// The bucket is denying all requests.
    Stopping,
}

/// The settlement of a [`TokenBucket::request_grant`] call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Grant {
    pub granted: bool,
    pub amount: f64,
    pub reason: GrantReason,
    /// Seconds between enqueueing and settlement; `0` for synchronous
    /// settlements.
    pub wait_duration: f64,
}

impl Grant {
    fn granted(amount: f64, wait_duration: f64) -> Self {
        Self {
            granted: true,
            amount,
            reason: GrantReason::Grant,
            wait_duration,
        }
    }

    fn denied(reason: GrantReason, wait_duration: f64) -> Self {
        Self {
            granted: false,
            amount: 0.0,
            reason,
            wait_duration,
        }
    }
}

/// The result of a [`TokenBucket::take_now`] call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TakeNow {
    pub granted: bool,
    pub amount: f64,
    /// When a denied request could plausibly be satisfied, as a clock
    /// reading.
    pub wait_until: f64,
}

/// A snapshot of bucket state as of the last mutating call.
///
/// Deliberately does not consult the time source.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketState {
    pub available_burst_size: f64,
    /// Remaining queue room in request tokens; `None` when unbounded.
    pub available_queue_size: Option<f64>,
    pub waiter_count: usize,
    /// The clock reading at the last mutating call.
    pub now: f64,
}

/// A token-bucket rate limiter with a FIFO wait queue.
///
/// Tokens accrue continuously at `flow_rate` per second up to
/// `max_burst_size`. Requests that cannot be satisfied synchronously wait
/// in strict arrival order; [`deny_all_requests`] releases every waiter
/// with [`GrantReason::Stopping`] and closes the bucket.
///
/// Cloning shares the underlying bucket.
///
/// [`deny_all_requests`]: TokenBucket::deny_all_requests
#[derive(Clone)]
pub struct TokenBucket {
    shared: Arc<Shared>,
}

struct Shared {
    flow_rate: f64,
    max_burst: f64,
    max_queue_grant: f64,
    max_queue: Option<f64>,
    partial_tokens: bool,
    clock: Arc<dyn Clock>,
    state: Mutex<State>,
    kick: Notify,
}

struct State {
    available: f64,
    last_now: f64,
    waiters: VecDeque<Waiter>,
    queued_total: f64,
    denying: bool,
    servicer_running: bool,
}

struct Waiter {
    target: f64,
    enqueue_time: f64,
    tx: oneshot::Sender<Grant>,
}

impl fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock().unwrap();
        f.debug_struct("TokenBucket")
            .field("flow_rate", &self.shared.flow_rate)
            .field("max_burst", &self.shared.max_burst)
            .field("available", &state.available)
            .field("waiters", &state.waiters.len())
            .finish()
    }
}

impl TokenBucket {
    /// Create a bucket on the default tokio-backed clock.
    pub fn new(config: TokenBucketConfig) -> Result<Self, ConfigError> {
        Self::with_clock(config, Arc::new(TokioClock::new()))
    }

    /// Create a bucket on an injected time source.
    pub fn with_clock(config: TokenBucketConfig, clock: Arc<dyn Clock>) -> Result<Self, ConfigError> {
        if !(config.flow_rate.is_finite() && config.flow_rate > 0.0) {
            return Err(ConfigError("flow_rate must be positive"));
        }
        if !(config.max_burst_size.is_finite() && config.max_burst_size > 0.0) {
            return Err(ConfigError("max_burst_size must be positive"));
        }
        let initial = config.initial_burst_size.unwrap_or(config.max_burst_size);
        if !(0.0..=config.max_burst_size).contains(&initial) {
            return Err(ConfigError(
                "initial_burst_size must lie within [0, max_burst_size]",
            ));
        }
        let grant_limit = config
            .max_queue_size
            .map_or(config.max_burst_size, |q| q.min(config.max_burst_size));
        let max_queue_grant = config.max_queue_grant_size.unwrap_or(grant_limit);
        if !(max_queue_grant > 0.0 && max_queue_grant <= grant_limit) {
            return Err(ConfigError(
                "max_queue_grant_size must lie within (0, min(max_burst_size, max_queue_size)]",
            ));
        }
        if let Some(max_queue) = config.max_queue_size {
            if !(max_queue.is_finite() && max_queue > 0.0) {
                return Err(ConfigError("max_queue_size must be positive"));
            }
        }

        let now = clock.now();
        Ok(Self {
            shared: Arc::new(Shared {
                flow_rate: config.flow_rate,
                max_burst: config.max_burst_size,
                max_queue_grant,
                max_queue: config.max_queue_size,
                partial_tokens: config.partial_tokens,
                clock,
                state: Mutex::new(State {
                    available: initial,
                    last_now: now,
                    waiters: VecDeque::new(),
                    queued_total: 0.0,
                    denying: false,
                    servicer_running: false,
                }),
                kick: Notify::new(),
            }),
        })
    }

    /// Request between `min` and `max` tokens, waiting in the FIFO queue
    /// when they cannot be granted synchronously.
    ///
    /// A zero-minimum request is always answered synchronously with
    /// whatever is free (possibly `0`), ahead of any queued waiters and
    /// without reordering them. Queued requests are clamped to the
    /// bucket's `max_queue_grant_size`; a request whose minimum exceeds
    /// that clamp, or which would overflow `max_queue_size`, is denied
    /// with [`GrantReason::Full`].
    pub async fn request_grant(&self, range: impl Into<GrantRange>) -> Grant {
        let range = range.into();
        let rx = {
            let mut state = self.shared.state.lock().unwrap();
            self.shared.refill(&mut state);

            if state.denying {
                return Grant::denied(GrantReason::Stopping, 0.0);
            }

            let usable = self.shared.usable(&state);
            if range.min == 0.0 {
                let amount = range.max.min(usable);
                state.available -= amount;
                return Grant::granted(amount, 0.0);
            }
            if state.waiters.is_empty() && usable >= range.min {
                let amount = range.max.min(usable);
                state.available -= amount;
                return Grant::granted(amount, 0.0);
            }

            let target = range.max.min(self.shared.max_queue_grant);
            if target < range.min || !self.shared.queue_has_room(&state, target) {
                return Grant::denied(GrantReason::Full, 0.0);
            }

            let (tx, rx) = oneshot::channel();
            let enqueue_time = state.last_now;
            state.waiters.push_back(Waiter {
                target,
                enqueue_time,
                tx,
            });
            state.queued_total += target;
            self.shared.ensure_servicer(&mut state);
            rx
        };

        self.shared.kick.notify_one();
        // A dropped sender means the bucket was torn down mid-wait.
        rx.await
            .unwrap_or_else(|_| Grant::denied(GrantReason::Stopping, 0.0))
    }

    /// Take tokens only if possible right now; never enqueues.
    ///
    /// On failure, `wait_until` projects when a retry could succeed,
    /// assuming everyone queued ahead takes their maximum.
    pub fn take_now(&self, range: impl Into<GrantRange>) -> TakeNow {
        let range = range.into();
        let mut state = self.shared.state.lock().unwrap();
        self.shared.refill(&mut state);
        let now = state.last_now;

        if state.denying {
            return TakeNow {
                granted: false,
                amount: 0.0,
                wait_until: now,
            };
        }

        let usable = self.shared.usable(&state);
        if range.min == 0.0 || (state.waiters.is_empty() && usable >= range.min) {
            let amount = range.max.min(usable);
            state.available -= amount;
            return TakeNow {
                granted: true,
                amount,
                wait_until: now,
            };
        }

        let backlog = state.queued_total + self.shared.max_queue_grant - usable;
        TakeNow {
            granted: false,
            amount: 0.0,
            wait_until: now + backlog / self.shared.flow_rate,
        }
    }

    /// Enter the denying state: release every queued waiter with
    /// [`GrantReason::Stopping`], and answer all subsequent requests as
    /// if the bucket were empty and closed.
    ///
    /// Resolves once every waiter has been dispatched.
    pub async fn deny_all_requests(&self) {
        let (now, waiters) = {
            let mut state = self.shared.state.lock().unwrap();
            self.shared.refill(&mut state);
            state.denying = true;
            state.queued_total = 0.0;
            (state.last_now, std::mem::take(&mut state.waiters))
        };

        for waiter in waiters {
            let _ = waiter.tx.send(Grant::denied(
                GrantReason::Stopping,
                now - waiter.enqueue_time,
            ));
        }
        self.shared.kick.notify_one();
    }

    /// State as of the last mutating call; the time source is not
    /// consulted.
    pub fn latest_state(&self) -> BucketState {
        let state = self.shared.state.lock().unwrap();
        BucketState {
            available_burst_size: state.available,
            available_queue_size: self.shared.max_queue.map(|max| max - state.queued_total),
            waiter_count: state.waiters.len(),
            now: state.last_now,
        }
    }
}

impl Shared {
    /// Advance simulated time and accrue tokens, clamped to the burst
    /// ceiling.
    fn refill(&self, state: &mut State) {
        let now = self.clock.now();
        if now > state.last_now {
            let accrued = self.flow_rate * (now - state.last_now);
            state.available = (state.available + accrued).min(self.max_burst);
            state.last_now = now;
        }
    }

    /// Burst actually usable for grants. Fractional burst is retained
    /// but unusable unless partial tokens are allowed.
    fn usable(&self, state: &State) -> f64 {
        if self.partial_tokens {
            state.available
        } else {
            state.available.floor()
        }
    }

    /// The amount a queued waiter with this target will receive.
    fn effective_amount(&self, target: f64) -> f64 {
        if self.partial_tokens {
            target
        } else {
            target.floor()
        }
    }

    fn queue_has_room(&self, state: &State, target: f64) -> bool {
        match self.max_queue {
            None => true,
            Some(max_queue) => state.queued_total + target <= max_queue,
        }
    }

    fn ensure_servicer(self: &Arc<Self>, state: &mut State) {
        if !state.servicer_running {
            state.servicer_running = true;
            let shared = self.clone();
            tokio::spawn(async move {
                shared.service_waiters().await;
            });
        }
    }

    /// Serve queued waiters in arrival order, sleeping on the clock
    /// until the head waiter's tokens have accrued.
    async fn service_waiters(self: Arc<Self>) {
        loop {
            let sleep_seconds = {
                let mut state = self.state.lock().unwrap();
                self.refill(&mut state);
                self.grant_ready_waiters(&mut state);
                if state.denying || state.waiters.is_empty() {
                    state.servicer_running = false;
                    return;
                }
                let head = state.waiters.front().unwrap();
                let needed = self.effective_amount(head.target);
                ((needed - state.available) / self.flow_rate).max(0.0)
            };

            tokio::select! {
                _ = self.clock.sleep(sleep_seconds) => {}
                _ = self.kick.notified() => {}
            }
        }
    }

    fn grant_ready_waiters(&self, state: &mut State) {
        while let Some(head) = state.waiters.front() {
            let amount = self.effective_amount(head.target);
            if self.usable(state) < amount {
                break;
            }
            let waiter = state.waiters.pop_front().unwrap();
            state.available -= amount;
            state.queued_total -= waiter.target;
            let _ = waiter.tx.send(Grant::granted(
                amount,
                state.last_now - waiter.enqueue_time,
            ));
        }
        if state.waiters.is_empty() {
            state.queued_total = 0.0;
        }
    }
}
