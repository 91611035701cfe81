//! AIMD rate limiter implementation

use crate::config::RateLimitConfig;
use rand::Rng;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;

/// Generic errors tolerated before concurrency is reduced by one
const ERROR_STEP_THRESHOLD: u32 = 5;

/// Multiplicative decay applied to the delay on every success
const DELAY_DECAY: f64 = 0.9;

/// Delays below this are treated as no delay at all
const DELAY_FLOOR: Duration = Duration::from_millis(1);

/// Static parameters of a rate limiter
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimiterSettings {
    pub min_concurrency: u32,
    pub initial_concurrency: u32,
    pub max_concurrency: u32,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    pub recovery_factor: f64,
    pub recovery_threshold: u32,

    /// When false the limiter is a fixed-size gate that only keeps statistics
    pub adaptive: bool,
}

impl RateLimiterSettings {
    /// Builds settings from configuration; `adaptive` follows the feature toggle
    pub fn from_config(config: &RateLimitConfig, adaptive: bool) -> Self {
        Self {
            min_concurrency: config.min_concurrency,
            initial_concurrency: config.initial_concurrency,
            max_concurrency: config.max_concurrency,
            max_delay: config.max_delay(),
            backoff_factor: config.backoff_factor,
            recovery_factor: config.recovery_factor,
            recovery_threshold: config.recovery_threshold,
            adaptive,
        }
    }
}

impl Default for RateLimiterSettings {
    fn default() -> Self {
        Self::from_config(&RateLimitConfig::default(), true)
    }
}

#[derive(Debug)]
struct LimiterState {
    current_concurrency: u32,
    current_delay: Duration,
    consecutive_success: u32,
    consecutive_errors: u32,
    rate_limit_count: u64,
    in_flight: u32,
    total_requests: u64,
    successes: u64,
    errors: u64,
}

/// Point-in-time view of the limiter, for reporting and tests
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimiterSnapshot {
    pub current_concurrency: u32,
    pub current_delay: Duration,
    pub consecutive_success: u32,
    pub consecutive_errors: u32,
    pub rate_limit_count: u64,
    pub in_flight: u32,
    pub total_requests: u64,
    pub successes: u64,
    pub errors: u64,
}

impl RateLimiterSnapshot {
    /// Fraction of reported outcomes that were successes
    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.successes as f64 / self.total_requests as f64
        }
    }
}

/// Adaptive concurrency gate plus inter-request delay
///
/// The concurrency bound lives in the same locked state as the AIMD counters,
/// so a resize is visible to the very next `acquire` that takes the lock.
pub struct RateLimiter {
    settings: RateLimiterSettings,
    state: Mutex<LimiterState>,
    slot_freed: Notify,
}

/// A held concurrency slot; dropping it releases the slot
#[must_use = "dropping the permit releases the slot immediately"]
pub struct RateLimitPermit<'a> {
    limiter: &'a RateLimiter,
}

impl Drop for RateLimitPermit<'_> {
    fn drop(&mut self) {
        self.limiter.release();
    }
}

/// `ceil(value * factor)` with a small tolerance for float noise
fn scaled_ceil(value: u32, factor: f64) -> u32 {
    let scaled = value as f64 * factor;
    (scaled - 1e-9).ceil().max(0.0) as u32
}

impl RateLimiter {
    pub fn new(settings: RateLimiterSettings) -> Self {
        let initial = settings
            .initial_concurrency
            .clamp(settings.min_concurrency, settings.max_concurrency);

        Self {
            state: Mutex::new(LimiterState {
                current_concurrency: initial,
                current_delay: Duration::ZERO,
                consecutive_success: 0,
                consecutive_errors: 0,
                rate_limit_count: 0,
                in_flight: 0,
                total_requests: 0,
                successes: 0,
                errors: 0,
            }),
            settings,
            slot_freed: Notify::new(),
        }
    }

    pub fn settings(&self) -> &RateLimiterSettings {
        &self.settings
    }

    fn lock(&self) -> MutexGuard<'_, LimiterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Waits for a free slot, then sleeps the current delay
    pub async fn acquire(&self) -> RateLimitPermit<'_> {
        let delay = loop {
            // Registered before the check so a release in between is not lost
            let notified = self.slot_freed.notified();
            {
                let mut state = self.lock();
                if state.in_flight < state.current_concurrency {
                    state.in_flight += 1;
                    break state.current_delay;
                }
            }
            notified.await;
        };

        let permit = RateLimitPermit { limiter: self };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        permit
    }

    /// Returns a slot to the gate
    fn release(&self) {
        {
            let mut state = self.lock();
            state.in_flight = state.in_flight.saturating_sub(1);
        }
        self.slot_freed.notify_waiters();
    }

    /// Reports a successful request
    pub fn record_success(&self) {
        let grown = {
            let mut state = self.lock();
            state.total_requests += 1;
            state.successes += 1;
            state.consecutive_success += 1;
            state.consecutive_errors = 0;

            if !self.settings.adaptive {
                return;
            }

            state.current_delay = state.current_delay.mul_f64(DELAY_DECAY);
            if state.current_delay < DELAY_FLOOR {
                state.current_delay = Duration::ZERO;
            }

            if state.consecutive_success >= self.settings.recovery_threshold
                && state.current_concurrency < self.settings.max_concurrency
            {
                let previous = state.current_concurrency;
                state.current_concurrency =
                    scaled_ceil(previous, self.settings.recovery_factor)
                        .min(self.settings.max_concurrency);
                state.consecutive_success = 0;
                tracing::debug!(
                    "Concurrency raised {} -> {}",
                    previous,
                    state.current_concurrency
                );
                true
            } else {
                false
            }
        };

        if grown {
            self.slot_freed.notify_waiters();
        }
    }

    /// Reports an upstream rate-limit signal (e.g. HTTP 429)
    pub fn record_rate_limited(&self) {
        let mut state = self.lock();
        state.total_requests += 1;
        state.errors += 1;
        state.rate_limit_count += 1;
        state.consecutive_errors += 1;
        state.consecutive_success = 0;

        if !self.settings.adaptive {
            return;
        }

        let previous = state.current_concurrency;
        state.current_concurrency = scaled_ceil(previous, self.settings.backoff_factor)
            .max(self.settings.min_concurrency);

        let jitter = rand::thread_rng().gen_range(1.0..=3.0);
        let added = Duration::from_secs_f64(jitter * state.consecutive_errors as f64);
        state.current_delay = (state.current_delay + added).min(self.settings.max_delay);

        tracing::info!(
            "Rate limited: concurrency {} -> {}, delay {:.2}s",
            previous,
            state.current_concurrency,
            state.current_delay.as_secs_f64()
        );
    }

    /// Reports any other failed request
    pub fn record_error(&self) {
        let mut state = self.lock();
        state.total_requests += 1;
        state.errors += 1;
        state.consecutive_errors += 1;
        state.consecutive_success = 0;

        if self.settings.adaptive && state.consecutive_errors >= ERROR_STEP_THRESHOLD {
            let previous = state.current_concurrency;
            state.current_concurrency = previous
                .saturating_sub(1)
                .max(self.settings.min_concurrency);
            state.consecutive_errors = 0;
            tracing::debug!(
                "Repeated errors: concurrency {} -> {}",
                previous,
                state.current_concurrency
            );
        }
    }

    pub fn snapshot(&self) -> RateLimiterSnapshot {
        let state = self.lock();
        RateLimiterSnapshot {
            current_concurrency: state.current_concurrency,
            current_delay: state.current_delay,
            consecutive_success: state.consecutive_success,
            consecutive_errors: state.consecutive_errors,
            rate_limit_count: state.rate_limit_count,
            in_flight: state.in_flight,
            total_requests: state.total_requests,
            successes: state.successes,
            errors: state.errors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::sync::Arc;

    fn settings(min: u32, initial: u32, max: u32) -> RateLimiterSettings {
        RateLimiterSettings {
            min_concurrency: min,
            initial_concurrency: initial,
            max_concurrency: max,
            max_delay: Duration::from_secs(10),
            backoff_factor: 0.5,
            recovery_factor: 1.5,
            recovery_threshold: 3,
            adaptive: true,
        }
    }

    #[test]
    fn test_scaled_ceil() {
        assert_eq!(scaled_ceil(4, 1.5), 6);
        assert_eq!(scaled_ceil(5, 1.5), 8);
        assert_eq!(scaled_ceil(5, 0.5), 3);
        assert_eq!(scaled_ceil(10, 0.7), 7);
        assert_eq!(scaled_ceil(1, 0.5), 1);
    }

    #[test]
    fn test_recovery_after_threshold() {
        let limiter = RateLimiter::new(settings(1, 4, 10));

        limiter.record_success();
        limiter.record_success();
        assert_eq!(limiter.snapshot().current_concurrency, 4);
        assert_eq!(limiter.snapshot().consecutive_success, 2);

        limiter.record_success();
        let snap = limiter.snapshot();
        assert_eq!(snap.current_concurrency, 6);
        assert_eq!(snap.consecutive_success, 0);
    }

    #[test]
    fn test_recovery_capped_at_max() {
        let limiter = RateLimiter::new(settings(1, 8, 10));
        for _ in 0..3 {
            limiter.record_success();
        }
        assert_eq!(limiter.snapshot().current_concurrency, 10);

        // At max the streak keeps counting and nothing changes
        for _ in 0..3 {
            limiter.record_success();
        }
        let snap = limiter.snapshot();
        assert_eq!(snap.current_concurrency, 10);
        assert_eq!(snap.consecutive_success, 3);
    }

    #[test]
    fn test_rate_limit_backs_off_and_delays() {
        let limiter = RateLimiter::new(settings(1, 5, 10));
        limiter.record_success();

        limiter.record_rate_limited();
        let snap = limiter.snapshot();
        assert_eq!(snap.current_concurrency, 3);
        assert_eq!(snap.consecutive_errors, 1);
        assert_eq!(snap.consecutive_success, 0);
        assert_eq!(snap.rate_limit_count, 1);
        let first = snap.current_delay.as_secs_f64();
        assert!((1.0..=3.0).contains(&first), "delay {}", first);

        limiter.record_rate_limited();
        let snap = limiter.snapshot();
        assert_eq!(snap.current_concurrency, 2);
        let added = snap.current_delay.as_secs_f64() - first;
        assert!((2.0 - 1e-6..=6.0 + 1e-6).contains(&added), "added {}", added);
    }

    #[test]
    fn test_rate_limit_respects_floor_and_delay_cap() {
        let mut s = settings(2, 2, 10);
        s.max_delay = Duration::from_millis(1500);
        let limiter = RateLimiter::new(s);

        for _ in 0..5 {
            limiter.record_rate_limited();
        }
        let snap = limiter.snapshot();
        assert_eq!(snap.current_concurrency, 2);
        assert_eq!(snap.current_delay, Duration::from_millis(1500));
    }

    #[test]
    fn test_delay_decays_on_success() {
        let limiter = RateLimiter::new(settings(1, 4, 10));
        limiter.record_rate_limited();
        let before = limiter.snapshot().current_delay;

        limiter.record_success();
        let after = limiter.snapshot().current_delay;
        let expected = before.mul_f64(0.9);
        let diff = after.as_secs_f64() - expected.as_secs_f64();
        assert!(diff.abs() < 1e-6);
    }

    #[test]
    fn test_generic_errors_step_down_every_five() {
        let limiter = RateLimiter::new(settings(1, 4, 10));
        for _ in 0..4 {
            limiter.record_error();
        }
        assert_eq!(limiter.snapshot().current_concurrency, 4);
        assert_eq!(limiter.snapshot().consecutive_errors, 4);

        limiter.record_error();
        let snap = limiter.snapshot();
        assert_eq!(snap.current_concurrency, 3);
        assert_eq!(snap.consecutive_errors, 0);
        // Generic errors never add delay
        assert_eq!(snap.current_delay, Duration::ZERO);
    }

    #[test]
    fn test_success_resets_error_streak() {
        let limiter = RateLimiter::new(settings(1, 4, 10));
        for _ in 0..4 {
            limiter.record_error();
        }
        limiter.record_success();
        limiter.record_error();
        assert_eq!(limiter.snapshot().current_concurrency, 4);
    }

    #[test]
    fn test_concurrency_stays_in_bounds() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut s = settings(2, 5, 9);
        s.max_delay = Duration::from_millis(10);
        let limiter = RateLimiter::new(s);

        for _ in 0..5_000 {
            match rng.gen_range(0..3) {
                0 => limiter.record_success(),
                1 => limiter.record_rate_limited(),
                _ => limiter.record_error(),
            }
            let snap = limiter.snapshot();
            assert!((2..=9).contains(&snap.current_concurrency));
            assert!(snap.current_delay <= Duration::from_millis(10));
        }
    }

    #[test]
    fn test_non_adaptive_only_counts() {
        let mut s = settings(1, 4, 10);
        s.adaptive = false;
        let limiter = RateLimiter::new(s);

        for _ in 0..10 {
            limiter.record_rate_limited();
            limiter.record_error();
        }
        let snap = limiter.snapshot();
        assert_eq!(snap.current_concurrency, 4);
        assert_eq!(snap.current_delay, Duration::ZERO);
        assert_eq!(snap.rate_limit_count, 10);
        assert_eq!(snap.total_requests, 20);
    }

    #[tokio::test]
    async fn test_acquire_blocks_at_bound() {
        let limiter = Arc::new(RateLimiter::new(settings(1, 1, 4)));

        let permit = limiter.acquire().await;
        assert_eq!(limiter.snapshot().in_flight, 1);

        let blocked =
            tokio::time::timeout(Duration::from_millis(50), limiter.acquire()).await;
        assert!(blocked.is_err());

        let waiter = {
            let limiter = limiter.clone();
            tokio::spawn(async move {
                let _permit = limiter.acquire().await;
                limiter.snapshot().in_flight
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(permit);

        let in_flight = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(in_flight, 1);
        assert_eq!(limiter.snapshot().in_flight, 0);
    }

    #[tokio::test]
    async fn test_growth_wakes_waiters() {
        let limiter = Arc::new(RateLimiter::new(settings(1, 1, 4)));
        let _held = limiter.acquire().await;

        let waiter = {
            let limiter = limiter.clone();
            tokio::spawn(async move {
                let _permit = limiter.acquire().await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        for _ in 0..3 {
            limiter.record_success();
        }
        assert_eq!(limiter.snapshot().current_concurrency, 2);

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_acquire_sleeps_current_delay() {
        let mut s = settings(1, 2, 4);
        s.max_delay = Duration::from_millis(60);
        let limiter = RateLimiter::new(s);
        limiter.record_rate_limited();

        let started = std::time::Instant::now();
        let _permit = limiter.acquire().await;
        assert!(started.elapsed() >= Duration::from_millis(55));
    }
}
