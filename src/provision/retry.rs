//! Bounded retry loops for the provisioner's polling steps.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;

/// How often and how long a step is retried.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first.
    pub attempts: u32,
    /// Pause after the first failed attempt.
    pub initial: Duration,
    /// Upper bound for any single pause.
    pub max: Duration,
    /// Whether the pause doubles after every failure.
    pub exponential: bool,
}

impl RetryPolicy {
    /// Retries at a constant interval.
    #[must_use]
    pub const fn fixed(attempts: u32, interval: Duration) -> Self {
        Self {
            attempts,
            initial: interval,
            max: interval,
            exponential: false,
        }
    }

    /// Retries with doubling pauses, capped at `max`.
    #[must_use]
    pub const fn exponential(attempts: u32, initial: Duration, max: Duration) -> Self {
        Self {
            attempts,
            initial,
            max,
            exponential: true,
        }
    }

    /// Returns the pause following failed attempt `attempt` (zero based).
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        if !self.exponential {
            return self.initial;
        }
        let factor = 1_u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial.saturating_mul(factor).min(self.max)
    }
}

/// Retry policies of every polling step.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Policies {
    /// Waiting for SSH to accept commands.
    pub ssh: RetryPolicy,
    /// Waiting for the runtime to listen on its TLS port.
    pub runtime: RetryPolicy,
    /// Waiting for the package manager lock.
    pub package_lock: RetryPolicy,
}

impl Default for Policies {
    fn default() -> Self {
        Self {
            ssh: RetryPolicy::exponential(60, Duration::from_secs(1), Duration::from_secs(8)),
            runtime: RetryPolicy::fixed(10, Duration::from_secs(3)),
            package_lock: RetryPolicy::fixed(10, Duration::from_secs(2)),
        }
    }
}

/// Classifies the failure of one attempt.
#[derive(Debug)]
pub enum Attempt<E> {
    /// Worth trying again.
    Transient(E),
    /// Retrying cannot help.
    Fatal(E),
}

/// Why a retry loop stopped without success.
#[derive(Debug)]
pub enum Exhausted<E> {
    /// An attempt failed fatally.
    Fatal(E),
    /// Every attempt failed; carries the last failure.
    GaveUp {
        /// Attempts made.
        attempts: u32,
        /// Failure of the final attempt.
        last: E,
    },
}

impl<E> Exhausted<E> {
    /// Returns the failure that ended the loop.
    #[must_use]
    pub fn into_last(self) -> E {
        match self {
            Self::Fatal(last) | Self::GaveUp { last, .. } => last,
        }
    }
}

/// Runs `operation` until it succeeds, fails fatally or `policy` runs out.
///
/// # Errors
///
/// Returns [`Exhausted`] describing the final failure.
pub async fn retry<T, E, F, Fut>(policy: RetryPolicy, mut operation: F) -> Result<T, Exhausted<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Attempt<E>>>,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(Attempt::Fatal(err)) => return Err(Exhausted::Fatal(err)),
            Err(Attempt::Transient(err)) => {
                attempt += 1;
                if attempt >= attempts {
                    return Err(Exhausted::GaveUp {
                        attempts,
                        last: err,
                    });
                }
                sleep(policy.delay(attempt - 1)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn exponential_pauses_double_until_the_cap() {
        let policy = RetryPolicy::exponential(60, Duration::from_secs(1), Duration::from_secs(8));
        let pauses: Vec<u64> = (0..6).map(|n| policy.delay(n).as_secs()).collect();
        assert_eq!(pauses, vec![1, 2, 4, 8, 8, 8]);
        assert_eq!(policy.delay(40), Duration::from_secs(8));
    }

    #[test]
    fn fixed_pauses_do_not_grow() {
        let policy = RetryPolicy::fixed(10, Duration::from_secs(3));
        assert_eq!(policy.delay(0), policy.delay(9));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_until_success() {
        let calls = &AtomicU32::new(0);
        let policy = RetryPolicy::fixed(5, Duration::from_secs(2));
        let started = tokio::time::Instant::now();
        let result: Result<u32, Exhausted<&str>> = retry(policy, || async move {
            let seen = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if seen < 3 {
                Err(Attempt::Transient("busy"))
            } else {
                Ok(seen)
            }
        })
        .await;
        assert!(matches!(result, Ok(3)));
        assert_eq!(started.elapsed(), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn budget_exhaustion_reports_the_last_failure() {
        let calls = &AtomicU32::new(0);
        let result: Result<(), Exhausted<u32>> =
            retry(RetryPolicy::fixed(4, Duration::from_millis(10)), || async move {
                Err(Attempt::Transient(calls.fetch_add(1, Ordering::SeqCst)))
            })
            .await;
        let Err(Exhausted::GaveUp { attempts, last }) = result else {
            panic!("expected the retry budget to run out");
        };
        assert_eq!((attempts, last), (4, 3));
    }

    #[tokio::test]
    async fn fatal_failures_stop_immediately() {
        let calls = &AtomicU32::new(0);
        let result: Result<(), Exhausted<&str>> =
            retry(RetryPolicy::fixed(10, Duration::from_secs(60)), || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Attempt::Fatal("broken"))
            })
            .await;
        assert!(matches!(result, Err(Exhausted::Fatal("broken"))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
