//! Rate limiting and admission control.
//!
//! The centerpiece is [`TokenBucket`], a token-bucket limiter with a FIFO
//! wait queue and fractional accrual, driven by an injectable [`Clock`].
//! [`RateLimiter`] is the admission-control seam an endpoint consults for
//! connections and requests; [`BucketRateLimiter`] implements it on top
//! of token buckets.

mod admit;
mod bucket;
mod clock;

pub use admit::{BucketRateLimiter, RateLimiter};
pub use bucket::{
    BucketState, ConfigError, Grant, GrantRange, GrantReason, TakeNow, TokenBucket,
    TokenBucketConfig,
};
pub use clock::{Clock, ManualClock, TokioClock};
