//! Eventually - poll a condition until it holds or a deadline passes
//!
//! The calling task is suspended between attempts (never the whole runtime), either for a
//! fixed `retry_wait` or for the next value of a [`Ratchet`](super::ratchet::Ratchet)
//! schedule when `ratchet_steps` is set.

use std::fmt;
use std::future::IntoFuture;
use std::rc::Rc;
use std::time::Duration;

use futures_util::future::LocalBoxFuture;
use thiserror::Error;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, trace, warn};

use super::ratchet::new_schedule;

/// Timeouts at or above this need `override_timeout_limit`.
pub const TIMEOUT_CEILING: Duration = Duration::from_secs(240);

const DEFAULT_RETRY_WAIT: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum PollError<E> {
    /// The deadline passed; carries the last failure.
    #[error("timed out after {attempts} attempts in {elapsed:?}: {last}")]
    Timeout {
        last: E,
        attempts: u32,
        elapsed: Duration,
    },

    /// The failure was not one of the acceptable kinds, so no retry was made.
    #[error("unacceptable failure: {0}")]
    Rejected(E),

    #[error("timeout {timeout:?} is huge (ceiling is {ceiling:?}); is it expected?")]
    TimeoutCeiling { timeout: Duration, ceiling: Duration },
}

impl<E> PollError<E> {
    pub fn is_timeout(&self) -> bool {
        matches!(self, PollError::Timeout { .. })
    }

    /// The underlying failure, if an attempt was made.
    pub fn into_failure(self) -> Option<E> {
        match self {
            PollError::Timeout { last, .. } | PollError::Rejected(last) => Some(last),
            PollError::TimeoutCeiling { .. } => None,
        }
    }
}

/// A boxed, restartable attempt for [`Eventually::run_all`].
pub type Attempt<'a, E> = Box<dyn FnMut() -> LocalBoxFuture<'a, Result<(), E>> + 'a>;

type Acceptable<E> = Rc<dyn Fn(&E) -> bool>;

/// Polling options. Build with [`Eventually::new`] or [`Eventually::soon`], then call
/// [`run`](Eventually::run).
pub struct Eventually<E> {
    retry_wait: Duration,
    timeout: Duration,
    ratchet_steps: Option<u32>,
    acceptable: Option<Acceptable<E>>,
    override_timeout_limit: bool,
    slow_factor: f64,
    label: String,
    verbose: bool,
}

impl<E> Clone for Eventually<E> {
    fn clone(&self) -> Self {
        Self {
            retry_wait: self.retry_wait,
            timeout: self.timeout,
            ratchet_steps: self.ratchet_steps,
            acceptable: self.acceptable.clone(),
            override_timeout_limit: self.override_timeout_limit,
            slow_factor: self.slow_factor,
            label: self.label.clone(),
            verbose: self.verbose,
        }
    }
}

impl<E> fmt::Debug for Eventually<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Eventually")
            .field("retry_wait", &self.retry_wait)
            .field("timeout", &self.timeout)
            .field("ratchet_steps", &self.ratchet_steps)
            .field("filtered", &self.acceptable.is_some())
            .field("override_timeout_limit", &self.override_timeout_limit)
            .field("slow_factor", &self.slow_factor)
            .field("label", &self.label)
            .finish()
    }
}

impl<E: fmt::Display> Eventually<E> {
    pub fn new(timeout: Duration) -> Self {
        Self {
            retry_wait: DEFAULT_RETRY_WAIT,
            timeout,
            ratchet_steps: None,
            acceptable: None,
            override_timeout_limit: false,
            slow_factor: 1.0,
            label: "condition".to_string(),
            verbose: true,
        }
    }

    /// 3 second budget, starting at 100ms between attempts and ratcheting over 10 steps.
    pub fn soon() -> Self {
        Self::new(Duration::from_secs(3))
            .retry_wait(Duration::from_millis(100))
            .ratchet_steps(10)
    }

    pub fn retry_wait(mut self, wait: Duration) -> Self {
        self.retry_wait = wait;
        self
    }

    pub fn ratchet_steps(mut self, steps: u32) -> Self {
        self.ratchet_steps = Some(steps);
        self
    }

    /// Only failures for which `filter` returns true are retried.
    pub fn acceptable(mut self, filter: impl Fn(&E) -> bool + 'static) -> Self {
        self.acceptable = Some(Rc::new(filter));
        self
    }

    pub fn override_timeout_limit(mut self) -> Self {
        self.override_timeout_limit = true;
        self
    }

    /// Stretch the timeout (and the ratchet seed) on slow machines.
    pub fn slow_factor(mut self, factor: f64) -> Self {
        self.slow_factor = factor.max(f64::MIN_POSITIVE);
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn quiet(mut self) -> Self {
        self.verbose = false;
        self
    }

    fn check_ceiling(&self) -> Result<(), PollError<E>> {
        if self.override_timeout_limit {
            debug!(
                "[EVENTUALLY] overriding timeout limit to {:?} for evaluating {}",
                self.timeout, self.label
            );
            return Ok(());
        }
        if self.timeout >= TIMEOUT_CEILING {
            return Err(PollError::TimeoutCeiling {
                timeout: self.timeout,
                ceiling: TIMEOUT_CEILING,
            });
        }
        Ok(())
    }

    fn is_acceptable(&self, failure: &E) -> bool {
        self.acceptable.as_ref().map_or(true, |accept| accept(failure))
    }

    /// Invoke `op` until it succeeds, fails with an unacceptable error, or the deadline
    /// passes. `op` may return any future, including `std::future::ready(..)`.
    pub async fn run<F, Fut, T>(&self, mut op: F) -> Result<T, PollError<E>>
    where
        F: FnMut() -> Fut,
        Fut: IntoFuture<Output = Result<T, E>>,
    {
        self.check_ceiling()?;

        let timeout = self.timeout.mul_f64(self.slow_factor);
        let start = Instant::now();
        let deadline = start + timeout;
        let mut schedule = self.ratchet_steps.map(|steps| {
            new_schedule(
                self.retry_wait.mul_f64(self.slow_factor),
                steps,
                timeout,
                timeout,
            )
        });
        let mut attempts: u32 = 0;

        loop {
            let now = Instant::now();
            let expired = now > deadline;
            if expired {
                warn!("[EVENTUALLY] {} last try...", self.label);
            }

            attempts += 1;
            match op().into_future().await {
                Ok(value) => {
                    if self.verbose {
                        debug!(
                            "[EVENTUALLY] {} succeeded with {:.2} seconds to spare",
                            self.label,
                            deadline.saturating_duration_since(Instant::now()).as_secs_f64()
                        );
                    }
                    return Ok(value);
                }
                Err(failure) => {
                    if !self.is_acceptable(&failure) {
                        return Err(PollError::Rejected(failure));
                    }
                    if expired {
                        error!(
                            "[EVENTUALLY] {} failed; not trying any more because {:?} have passed ({} attempts): {}",
                            self.label, timeout, attempts, failure
                        );
                        return Err(PollError::Timeout {
                            last: failure,
                            attempts,
                            elapsed: start.elapsed(),
                        });
                    }
                    if self.verbose {
                        trace!(
                            "[EVENTUALLY] {} not succeeded yet, {:.2} seconds remaining...",
                            self.label,
                            deadline.saturating_duration_since(now).as_secs_f64()
                        );
                    }
                    let wait = schedule
                        .as_mut()
                        .and_then(|s| s.next())
                        .unwrap_or(self.retry_wait);
                    sleep(wait).await;
                }
            }
        }
    }

    /// [`run`](Eventually::run) for a plain closure.
    pub async fn run_sync<F, T>(&self, mut op: F) -> Result<T, PollError<E>>
    where
        F: FnMut() -> Result<T, E>,
    {
        self.run(move || std::future::ready(op())).await
    }

    /// Run every attempt in order through [`run`](Eventually::run), sharing this poller's
    /// timeout as one shrinking budget. Up to `acceptable_fails` attempts may fail; the
    /// failure that exceeds that count is returned. On success returns how many failed.
    pub async fn run_all<'a>(
        &self,
        attempts: Vec<Attempt<'a, E>>,
        acceptable_fails: usize,
    ) -> Result<usize, PollError<E>> {
        self.check_ceiling()?;

        let total = self.timeout.mul_f64(self.slow_factor);
        let start = Instant::now();
        let count = attempts.len();
        let mut fails = 0;

        for (idx, mut attempt) in attempts.into_iter().enumerate() {
            let remaining = total.saturating_sub(start.elapsed());
            let poller = Eventually {
                retry_wait: self.retry_wait,
                timeout: remaining,
                ratchet_steps: None,
                acceptable: self.acceptable.clone(),
                override_timeout_limit: true,
                slow_factor: 1.0,
                label: format!("{} #{}", self.label, idx),
                verbose: false,
            };

            if let Err(err) = poller.run(&mut attempt).await {
                fails += 1;
                debug!(
                    "[EVENTUALLY] {} #{} timed out without succeeding; fail count: {}, acceptable: {}",
                    self.label, idx, fails, acceptable_fails
                );
                if fails > acceptable_fails {
                    return Err(err);
                }
            }
        }

        debug!(
            "[EVENTUALLY] {} ({} attempts) succeeded with {:.2} seconds to spare",
            self.label,
            count,
            total.saturating_sub(start.elapsed()).as_secs_f64()
        );
        Ok(fails)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;
    use std::cell::Cell;

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_two_failures() {
        let calls = Cell::new(0u32);
        let result = Eventually::new(Duration::from_secs(5))
            .retry_wait(Duration::from_millis(10))
            .run_sync(|| {
                calls.set(calls.get() + 1);
                if calls.get() < 3 {
                    Err("not yet")
                } else {
                    Ok(42)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.get(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_async_operation() {
        let calls = Cell::new(0u32);
        let result = Eventually::new(Duration::from_secs(1))
            .retry_wait(Duration::from_millis(10))
            .run(|| {
                calls.set(calls.get() + 1);
                let n = calls.get();
                async move {
                    tokio::task::yield_now().await;
                    if n < 2 {
                        Err("pending")
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out() {
        let calls = Cell::new(0u32);
        let start = Instant::now();
        let result: Result<(), _> = Eventually::new(Duration::from_millis(50))
            .retry_wait(Duration::from_millis(10))
            .run_sync(|| {
                calls.set(calls.get() + 1);
                Err("never")
            })
            .await;

        match result {
            Err(PollError::Timeout { last, attempts, .. }) => {
                assert_eq!(last, "never");
                assert_eq!(attempts, calls.get());
            }
            other => panic!("expected timeout, got {:?}", other),
        }
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert!(calls.get() < 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacceptable_failure_is_not_retried() {
        let calls = Cell::new(0u32);
        let result: Result<(), _> = Eventually::new(Duration::from_secs(1))
            .acceptable(|e: &&'static str| *e == "transient")
            .run_sync(|| {
                calls.set(calls.get() + 1);
                Err("fatal")
            })
            .await;

        assert!(matches!(result, Err(PollError::Rejected("fatal"))));
        assert_eq!(calls.get(), 1);
    }

    #[tokio::test]
    async fn test_timeout_ceiling() {
        let calls = Cell::new(0u32);
        let result: Result<(), PollError<&str>> = Eventually::new(Duration::from_secs(300))
            .run_sync(|| {
                calls.set(calls.get() + 1);
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(PollError::TimeoutCeiling { .. })));
        assert_eq!(calls.get(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_ceiling_override() {
        let result: Result<u8, PollError<&str>> = Eventually::new(Duration::from_secs(300))
            .override_timeout_limit()
            .run_sync(|| Ok(1))
            .await;
        assert_eq!(result.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ratchet_waits_grow() {
        let stamps = std::cell::RefCell::new(Vec::new());
        let _: Result<(), _> = Eventually::soon()
            .run_sync(|| {
                stamps.borrow_mut().push(Instant::now());
                Err("never")
            })
            .await;

        let stamps = stamps.into_inner();
        assert!(stamps.len() >= 3);
        let gaps: Vec<Duration> = stamps.windows(2).map(|w| w[1] - w[0]).collect();
        assert!(gaps.windows(2).all(|g| g[0] <= g[1]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_all_tolerates_failures() {
        let mut attempts: Vec<Attempt<'_, &str>> = Vec::new();
        attempts.push(Box::new(|| async { Ok::<(), &str>(()) }.boxed_local()));
        attempts.push(Box::new(|| async { Err::<(), &str>("down") }.boxed_local()));
        attempts.push(Box::new(|| async { Ok::<(), &str>(()) }.boxed_local()));

        let fails = Eventually::new(Duration::from_millis(200))
            .retry_wait(Duration::from_millis(10))
            .run_all(attempts, 1)
            .await
            .unwrap();
        assert_eq!(fails, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_all_exceeding_failures() {
        let mut attempts: Vec<Attempt<'_, &str>> = Vec::new();
        attempts.push(Box::new(|| async { Err::<(), &str>("first") }.boxed_local()));
        attempts.push(Box::new(|| async { Err::<(), &str>("second") }.boxed_local()));

        let err = Eventually::new(Duration::from_millis(100))
            .retry_wait(Duration::from_millis(10))
            .run_all(attempts, 1)
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(err.into_failure(), Some("second"));
    }
}
