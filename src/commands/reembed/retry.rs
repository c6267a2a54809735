use std::thread;
use std::time::{Duration, Instant};

use crate::config::RetryConfig;
use crate::embedding::{EmbedError, FailureKind};

const PAUSE_SLICE: Duration = Duration::from_millis(50);

/// Bounded exponential backoff for transient embedding failures.
#[derive(Debug, Clone)]
pub(crate) struct RetryPolicy {
    max_retries: u32,
    base_backoff: Duration,
    max_backoff: Duration,
}

/// Final result of a retried call plus how many attempts it took.
#[derive(Debug)]
pub(crate) struct Attempted<T> {
    pub(crate) result: Result<T, EmbedError>,
    pub(crate) attempts: u32,
}

impl RetryPolicy {
    pub(crate) fn new(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_backoff: config.base_backoff,
            max_backoff: config.max_backoff.max(config.base_backoff),
        }
    }

    /// Delay before retry number `retry` (1-based).
    pub(crate) fn backoff(&self, retry: u32) -> Duration {
        let shift = retry.saturating_sub(1).min(16);
        self.base_backoff
            .saturating_mul(1_u32 << shift)
            .min(self.max_backoff)
    }

    /// Runs `op` until it succeeds, fails non-transiently, runs out of
    /// retries, or `stop` reports true between attempts.
    pub(crate) fn run<T>(
        &self,
        stop: impl Fn() -> bool,
        mut op: impl FnMut() -> Result<T, EmbedError>,
        mut on_retry: impl FnMut(u32, &EmbedError, Duration),
    ) -> Attempted<T> {
        let mut attempts = 0_u32;
        loop {
            attempts += 1;
            let result = op();
            let retryable = matches!(&result, Err(err) if err.kind() == FailureKind::Transient);

            if !retryable || attempts > self.max_retries || stop() {
                return Attempted { result, attempts };
            }

            let delay = self.backoff(attempts);
            if let Err(err) = &result {
                on_retry(attempts, err, delay);
            }
            if !pause(delay, &stop) {
                return Attempted { result, attempts };
            }
        }
    }
}

/// Sleeps for `delay` in short slices. Returns false as soon as `stop` fires.
fn pause(delay: Duration, stop: &impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + delay;
    loop {
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        if stop() {
            return false;
        }
        thread::sleep((deadline - now).min(PAUSE_SLICE));
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    fn policy(max_retries: u32, base_ms: u64, max_ms: u64) -> RetryPolicy {
        RetryPolicy::new(&RetryConfig {
            max_retries,
            base_backoff: Duration::from_millis(base_ms),
            max_backoff: Duration::from_millis(max_ms),
        })
    }

    #[test]
    fn backoff_doubles_until_capped() {
        let policy = policy(10, 500, 8_000);
        let delays = (1..=7)
            .map(|retry| policy.backoff(retry).as_millis())
            .collect::<Vec<_>>();
        assert_eq!(delays, [500, 1_000, 2_000, 4_000, 8_000, 8_000, 8_000]);
    }

    #[test]
    fn transient_errors_retry_until_success() {
        let policy = policy(3, 0, 0);
        let calls = Cell::new(0);
        let mut retries = Vec::new();

        let outcome = policy.run(
            || false,
            || {
                calls.set(calls.get() + 1);
                if calls.get() < 3 {
                    Err(EmbedError::transient("rate limited"))
                } else {
                    Ok(calls.get())
                }
            },
            |attempt, _, _| retries.push(attempt),
        );

        assert_eq!(outcome.result.unwrap(), 3);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(retries, [1, 2]);
    }

    #[test]
    fn retries_are_bounded() {
        let policy = policy(2, 0, 0);
        let outcome = policy.run(|| false, || Err::<(), _>(EmbedError::transient("503")), |_, _, _| {});

        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.result.unwrap_err().kind(), FailureKind::Transient);
    }

    #[test]
    fn permanent_and_fatal_errors_are_not_retried() {
        let policy = policy(5, 0, 0);
        let permanent = policy.run(|| false, || Err::<(), _>(EmbedError::permanent("empty")), |_, _, _| {});
        assert_eq!(permanent.attempts, 1);

        let fatal = policy.run(|| false, || Err::<(), _>(EmbedError::fatal("401")), |_, _, _| {});
        assert_eq!(fatal.attempts, 1);
    }

    #[test]
    fn stop_during_backoff_cuts_the_wait_short() {
        let policy = policy(3, 60_000, 60_000);
        let checks = Cell::new(0);
        let started = Instant::now();

        let outcome = policy.run(
            || {
                checks.set(checks.get() + 1);
                checks.get() > 1
            },
            || Err::<(), _>(EmbedError::transient("429")),
            |_, _, _| {},
        );

        assert_eq!(outcome.attempts, 1);
        assert!(outcome.result.is_err());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn stop_flag_ends_retries_early() {
        let policy = policy(5, 0, 0);
        let outcome = policy.run(|| true, || Err::<(), _>(EmbedError::transient("timeout")), |_, _, _| {});
        assert_eq!(outcome.attempts, 1);
    }
}
