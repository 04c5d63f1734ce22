//! Bounded-retry connection bootstrap.
//!
//! The backend may still be starting when the service boots (containers
//! coming up side by side), so the first connection is retried at a fixed
//! interval until it succeeds or the overall budget runs out.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{info, warn};

use crate::error::StorageError;

/// How long to keep retrying and how often.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay between the start of consecutive attempts.
    pub interval: Duration,
    /// Total time budget, measured from the first attempt.
    pub budget: Duration,
}

impl RetryPolicy {
    pub fn new(interval: Duration, budget: Duration) -> Self {
        Self { interval, budget }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            budget: Duration::from_secs(30),
        }
    }
}

/// Run `attempt` every `policy.interval` until it yields a value.
///
/// The first attempt starts immediately. An attempt still pending when the
/// budget expires is dropped. Exhausting the budget returns
/// [`StorageError::StartupTimeout`] and never a handle.
pub async fn connect_with_retry<T, E, F, Fut>(
    policy: RetryPolicy,
    mut attempt: F,
) -> Result<T, StorageError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let deadline = Instant::now() + policy.budget;
    let mut ticker = time::interval(policy.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut attempts = 0u32;

    let timed_out = |attempts: u32| StorageError::StartupTimeout {
        budget: policy.budget,
        attempts,
    };

    loop {
        tokio::select! {
            biased;
            _ = time::sleep_until(deadline) => return Err(timed_out(attempts)),
            _ = ticker.tick() => {}
        }

        attempts += 1;
        match time::timeout_at(deadline, attempt()).await {
            Ok(Ok(value)) => {
                info!(attempts, "backend connection established");
                return Ok(value);
            }
            Ok(Err(e)) => {
                warn!(attempt = attempts, error = %e, retry_in = ?policy.interval, "connection attempt failed");
            }
            Err(_) => return Err(timed_out(attempts)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(Duration::from_secs(5), Duration::from_secs(30))
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_budget() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let started = Instant::now();

        let result = connect_with_retry(policy(), || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>("connection refused") }
        })
        .await;

        match result {
            Err(StorageError::StartupTimeout { budget, attempts }) => {
                assert_eq!(budget, Duration::from_secs(30));
                assert_eq!(attempts, calls.load(Ordering::SeqCst));
            }
            other => panic!("expected StartupTimeout, got {other:?}"),
        }
        assert!(calls.load(Ordering::SeqCst) > 1);
        assert!(started.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_on_later_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result = connect_with_retry(policy(), || {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n < 3 {
                    Err("not yet")
                } else {
                    Ok("handle")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "handle");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn first_attempt_is_immediate() {
        let started = Instant::now();
        let result = connect_with_retry(policy(), || async { Ok::<_, String>(42) }).await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_attempt_is_cut_off_at_deadline() {
        let result = connect_with_retry(policy(), || async {
            std::future::pending::<Result<(), String>>().await
        })
        .await;
        assert!(matches!(
            result,
            Err(StorageError::StartupTimeout { attempts: 1, .. })
        ));
    }
}
