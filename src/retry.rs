//! Bounded-attempt retry wrapper for probe fetches.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// Fixed-interval retry policy: up to `limit` attempts with `interval`
/// between failed ones.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    limit: u32,
    interval: Duration,
}

/// The result of a retried operation plus the number of retries consumed
/// (attempts made minus one).
pub struct Retried<T, E> {
    pub outcome: Result<T, E>,
    pub retries: u32,
}

impl RetryPolicy {
    pub fn new(limit: u32, interval: Duration) -> Self {
        Self {
            limit: limit.max(1),
            interval,
        }
    }

    /// Run `op` until it succeeds or the attempt budget is exhausted.
    pub async fn run<T, E, F, Fut>(&self, mut op: F) -> Retried<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => {
                    return Retried {
                        outcome: Ok(value),
                        retries: attempt - 1,
                    }
                }
                Err(err) => {
                    if attempt >= self.limit {
                        return Retried {
                            outcome: Err(err),
                            retries: attempt - 1,
                        };
                    }
                    sleep(self.interval).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn succeeds_on_first_attempt_with_zero_retries() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1));
        let result = policy.run(|| async { Ok::<_, &str>(42) }).await;
        assert_eq!(result.outcome.unwrap(), 42);
        assert_eq!(result.retries, 0);
    }

    #[tokio::test]
    async fn recovers_after_transient_failures() {
        let attempts = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, Duration::from_millis(1));
        let result = policy
            .run(|| {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err("unreachable")
                    } else {
                        Ok("molcajete")
                    }
                }
            })
            .await;
        assert_eq!(result.outcome.unwrap(), "molcajete");
        assert_eq!(result.retries, 2);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_the_attempt_budget() {
        let attempts = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, Duration::from_millis(1));
        let result: Retried<(), &str> = policy
            .run(|| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err("down") }
            })
            .await;
        assert_eq!(result.outcome.unwrap_err(), "down");
        assert_eq!(result.retries, 2);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn a_zero_limit_still_makes_one_attempt() {
        let policy = RetryPolicy::new(0, Duration::from_millis(1));
        let result = policy.run(|| async { Ok::<_, &str>(()) }).await;
        assert!(result.outcome.is_ok());
        assert_eq!(result.retries, 0);
    }
}
