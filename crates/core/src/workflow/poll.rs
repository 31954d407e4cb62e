//! Bounded polling with exponential backoff.

use std::future::Future;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::config::PollConfig;

/// Why a bounded poll stopped without a result.
#[derive(Debug)]
pub enum PollError<E> {
    /// The hard deadline passed before the check reported completion.
    TimedOut { elapsed: Duration, attempts: u32 },
    /// The check itself failed.
    Failed(E),
}

/// Repeatedly checks an external operation until it completes, fails or
/// the deadline passes.
#[derive(Debug, Clone)]
pub struct BoundedPoll {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    timeout: Duration,
}

impl BoundedPoll {
    pub fn new(config: &PollConfig) -> Self {
        Self {
            initial: config.initial_interval(),
            max: config.max_interval(),
            multiplier: config.multiplier.max(1.0),
            timeout: config.timeout(),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Delay before the check following `attempt` (0-based).
    pub fn interval_after(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.min(64) as i32);
        let millis = (self.initial.as_millis() as f64 * factor).min(self.max.as_millis() as f64);
        Duration::from_millis(millis as u64)
    }

    /// Run `check` until it yields `Some`.
    ///
    /// The first check runs immediately. Later checks are spaced by the
    /// backoff schedule, and the last sleep is cut short so the deadline
    /// is never overshot by more than one check.
    pub async fn run<T, E, F, Fut>(&self, mut check: F) -> Result<T, PollError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Option<T>, E>>,
    {
        let started = Instant::now();
        let mut attempt = 0u32;

        loop {
            if let Some(value) = check().await.map_err(PollError::Failed)? {
                return Ok(value);
            }

            let elapsed = started.elapsed();
            if elapsed >= self.timeout {
                return Err(PollError::TimedOut {
                    elapsed,
                    attempts: attempt + 1,
                });
            }

            let delay = self.interval_after(attempt).min(self.timeout - elapsed);
            debug!(attempt, delay_ms = delay.as_millis() as u64, "Operation pending");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn poll(initial_ms: u64, max_ms: u64, timeout_ms: u64) -> BoundedPoll {
        BoundedPoll {
            initial: Duration::from_millis(initial_ms),
            max: Duration::from_millis(max_ms),
            multiplier: 2.0,
            timeout: Duration::from_millis(timeout_ms),
        }
    }

    #[test]
    fn test_backoff_schedule_is_capped() {
        let p = poll(100, 1000, 10_000);
        assert_eq!(p.interval_after(0), Duration::from_millis(100));
        assert_eq!(p.interval_after(1), Duration::from_millis(200));
        assert_eq!(p.interval_after(3), Duration::from_millis(800));
        assert_eq!(p.interval_after(4), Duration::from_millis(1000));
        assert_eq!(p.interval_after(60), Duration::from_millis(1000));
    }

    #[test]
    fn test_new_from_config() {
        let p = BoundedPoll::new(&PollConfig {
            initial_interval_ms: 10,
            max_interval_ms: 50,
            multiplier: 0.5,
            timeout_secs: 3,
        });
        assert_eq!(p.timeout(), Duration::from_secs(3));
        assert_eq!(p.interval_after(5), Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_completes_after_pending_checks() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, PollError<()>> = poll(1, 5, 5_000)
            .run(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move { Ok(if n >= 2 { Some(n) } else { None }) }
            })
            .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_times_out() {
        let result: Result<(), PollError<()>> =
            poll(5, 10, 40).run(|| async { Ok(None) }).await;
        match result {
            Err(PollError::TimedOut { elapsed, attempts }) => {
                assert!(elapsed >= Duration::from_millis(40));
                assert!(attempts >= 2);
            }
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_check_failure_stops_polling() {
        let result: Result<(), PollError<&str>> =
            poll(1, 1, 1_000).run(|| async { Err("gone") }).await;
        assert!(matches!(result, Err(PollError::Failed("gone"))));
    }
}
