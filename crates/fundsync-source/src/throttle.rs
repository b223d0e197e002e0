//! Retry schedule and client-side request quota for Bitable calls.

use std::time::{Duration, Instant};

use reqwest::StatusCode;
use tokio::sync::Mutex;

/// Doubling delay between attempts, starting at `initial_delay` and capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    pub fn attempts(&self) -> usize {
        self.max_retries + 1
    }

    /// Pause before retry number `retry` (the first retry is 1).
    pub fn delay_before(&self, retry: usize) -> Duration {
        let mut delay = self.initial_delay;
        for _ in 1..retry {
            if delay >= self.max_delay {
                break;
            }
            delay = delay.saturating_mul(2);
        }
        delay.min(self.max_delay)
    }
}

/// Lark answers quota overruns with 429 and overload with 5xx; both clear up on their own.
pub(crate) fn retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

pub(crate) fn retryable_transport(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

/// Paces requests of one Lark app to `per_second`, allowing a burst of the same size.
///
/// Callers that arrive with the allowance spent reserve the next slot before
/// sleeping, so concurrent callers are served in arrival order.
#[derive(Debug)]
pub struct RequestQuota {
    per_second: f64,
    burst: f64,
    state: Mutex<QuotaState>,
}

#[derive(Debug)]
struct QuotaState {
    available: f64,
    updated: Instant,
}

impl RequestQuota {
    pub fn per_second(limit: u32) -> Self {
        let limit = f64::from(limit.max(1));
        Self {
            per_second: limit,
            burst: limit,
            state: Mutex::new(QuotaState {
                available: limit,
                updated: Instant::now(),
            }),
        }
    }

    pub async fn acquire(&self) {
        let wait = {
            let mut state = self.state.lock().await;
            self.reserve(&mut state, Instant::now())
        };
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }

    fn reserve(&self, state: &mut QuotaState, now: Instant) -> Duration {
        let elapsed = now.saturating_duration_since(state.updated).as_secs_f64();
        state.available = (state.available + elapsed * self.per_second).min(self.burst);
        state.updated = now;
        state.available -= 1.0;
        if state.available >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-state.available / self.per_second)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delays_double_up_to_the_cap() {
        let policy = RetryPolicy {
            max_retries: 4,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(1),
        };
        let delays: Vec<_> = (1..=5).map(|retry| policy.delay_before(retry)).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(250),
                Duration::from_millis(500),
                Duration::from_secs(1),
                Duration::from_secs(1),
                Duration::from_secs(1),
            ]
        );
        assert_eq!(policy.attempts(), 5);
        assert_eq!(policy.delay_before(usize::MAX), Duration::from_secs(1));
    }

    #[test]
    fn quota_and_overload_statuses_are_retried() {
        assert!(retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(retryable_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(!retryable_status(StatusCode::NOT_FOUND));
        assert!(!retryable_status(StatusCode::BAD_REQUEST));
    }

    #[test]
    fn quota_allows_a_burst_then_spaces_requests() {
        let quota = RequestQuota::per_second(4);
        let mut state = quota.state.try_lock().expect("uncontended");
        let start = state.updated;

        for _ in 0..4 {
            assert_eq!(quota.reserve(&mut state, start), Duration::ZERO);
        }
        let fifth = quota.reserve(&mut state, start);
        let sixth = quota.reserve(&mut state, start);
        assert!((fifth.as_secs_f64() - 0.25).abs() < 1e-9);
        assert!((sixth.as_secs_f64() - 0.5).abs() < 1e-9);

        // Two seconds later the debt is repaid and the burst is full again, but no more.
        let later = start + Duration::from_secs(2);
        for _ in 0..4 {
            assert_eq!(quota.reserve(&mut state, later), Duration::ZERO);
        }
        assert!(quota.reserve(&mut state, later) > Duration::ZERO);
    }

    #[tokio::test]
    async fn acquire_within_the_burst_does_not_wait() {
        let quota = RequestQuota::per_second(3);
        let started = Instant::now();
        for _ in 0..3 {
            quota.acquire().await;
        }
        assert!(started.elapsed() < Duration::from_millis(200));
    }
}
