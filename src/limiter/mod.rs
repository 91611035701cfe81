//! Adaptive admission control
//!
//! The rate limiter is an AIMD controller: it grows the number of concurrent
//! requests slowly while the upstream is happy and cuts it sharply when the
//! upstream signals rate limiting. Every caller waits for a slot and then for
//! the current inter-request delay.

mod rate_limiter;

pub use rate_limiter::{RateLimitPermit, RateLimiter, RateLimiterSettings, RateLimiterSnapshot};
