//! Ratchet - bounded exponential wait schedules
//!
//! Models the curve `y = a * e^(b*x) + c`, clamped below by `base` and above by `peak`.
//! Used to pace retries in [`crate::util::eventually`] and, when enabled, reconnection
//! attempts in the connection maintainer.

use std::time::Duration;

/// Upper bound for `b * steps` while solving for the growth rate (keeps `exp` finite).
const MAX_EXPONENT: f64 = 700.0;

const SOLVER_ITERATIONS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ratchet {
    a: f64,
    b: f64,
    c: f64,
    base: Option<f64>,
    peak: Option<f64>,
}

impl Ratchet {
    pub fn new(a: f64, b: f64, c: f64, base: Option<f64>, peak: Option<f64>) -> Self {
        Self {
            a,
            b,
            c,
            base,
            peak,
        }
    }

    /// Curve that starts at `start` and whose first `steps` values add up to `total`.
    ///
    /// When `total` is not larger than `start * steps` the growth rate is pinned at zero,
    /// so the schedule never shrinks.
    pub fn from_goal_duration(start: f64, steps: u32, total: f64) -> Self {
        Self::new(start, solve_growth(start, steps, total), 0.0, None, None)
    }

    pub fn with_peak(mut self, peak: f64) -> Self {
        self.peak = Some(peak);
        self
    }

    pub fn growth(&self) -> f64 {
        self.b
    }

    /// Value of the curve at `iteration`, in seconds.
    pub fn get(&self, iteration: u32) -> f64 {
        let mut v = self.a * (self.b * f64::from(iteration)).exp() + self.c;
        if let Some(base) = self.base {
            v = v.max(base);
        }
        if let Some(peak) = self.peak {
            v = v.min(peak);
        }
        v
    }

    /// Wait at `iteration`. Saturates at `Duration::MAX` when the curve outgrows it.
    pub fn wait(&self, iteration: u32) -> Duration {
        let secs = self.get(iteration);
        if secs.is_nan() || secs <= 0.0 {
            return Duration::ZERO;
        }
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }

    /// Infinite schedule of waits, restarting from iteration zero on every call.
    pub fn schedule(&self) -> Schedule {
        Schedule {
            ratchet: *self,
            iteration: 0,
        }
    }
}

/// Lazy, infinite sequence of waits produced by a [`Ratchet`].
#[derive(Debug, Clone)]
pub struct Schedule {
    ratchet: Ratchet,
    iteration: u32,
}

impl Iterator for Schedule {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let wait = self.ratchet.wait(self.iteration);
        self.iteration = self.iteration.saturating_add(1);
        Some(wait)
    }
}

/// Schedule whose first wait is `initial_wait`, whose first `steps` waits add up to
/// roughly `horizon`, and which never exceeds `peak`.
pub fn new_schedule(initial_wait: Duration, steps: u32, horizon: Duration, peak: Duration) -> Schedule {
    Ratchet::from_goal_duration(initial_wait.as_secs_f64(), steps, horizon.as_secs_f64())
        .with_peak(peak.as_secs_f64())
        .schedule()
}

/// Sum of the first `steps` terms of `a * e^(b*x)`.
fn sum_series(a: f64, b: f64, steps: u32) -> f64 {
    let n = f64::from(steps);
    if b.abs() < 1e-12 {
        return a * n;
    }
    a * ((b * n).exp() - 1.0) / (b.exp() - 1.0)
}

/// Growth rate `b >= 0` such that `sum_series(start, b, steps) == total`, by bisection.
fn solve_growth(start: f64, steps: u32, total: f64) -> f64 {
    if steps <= 1 || start <= 0.0 || !total.is_finite() || total <= start * f64::from(steps) {
        return 0.0;
    }

    let max_b = MAX_EXPONENT / f64::from(steps);
    let mut lo = 0.0_f64;
    let mut hi = 1.0_f64.min(max_b);
    while sum_series(start, hi, steps) < total && hi < max_b {
        lo = hi;
        hi = (hi * 2.0).min(max_b);
    }

    for _ in 0..SOLVER_ITERATIONS {
        let mid = (lo + hi) / 2.0;
        if sum_series(start, mid, steps) < total {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    (lo + hi) / 2.0
}
