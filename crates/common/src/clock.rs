//! Progress clock and timing utilities.
//!
//! Long-running stages report progress as a fraction of known work. This
//! module provides utilities for:
//! - Wall-clock ETA by linear extrapolation from elapsed time
//! - Monotonic progress (a fraction never moves backwards)
//! - Bounded-cardinality notifications (e.g. one per 10% step)

use std::time::{Duration, Instant};

/// Tracks elapsed time for one unit of work and extrapolates the remainder.
#[derive(Debug, Clone)]
pub struct ProgressClock {
    /// The instant work started.
    epoch: Instant,

    /// Wall-clock time at epoch (RFC 3339 string).
    epoch_wall: String,

    /// Highest fraction reported so far.
    fraction: f64,
}

impl ProgressClock {
    /// Start a new clock anchored to now.
    pub fn start() -> Self {
        Self {
            epoch: Instant::now(),
            epoch_wall: chrono::Utc::now().to_rfc3339(),
            fraction: 0.0,
        }
    }

    /// Create a clock from a known epoch.
    pub fn from_epoch(epoch: Instant, wall: String) -> Self {
        Self {
            epoch,
            epoch_wall: wall,
            fraction: 0.0,
        }
    }

    /// Seconds elapsed since start.
    pub fn elapsed_secs(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }

    /// Wall-clock time at start.
    pub fn epoch_wall(&self) -> &str {
        &self.epoch_wall
    }

    /// Record a new progress fraction. Values are clamped to `[0, 1]` and
    /// never decrease; the effective fraction is returned.
    pub fn advance(&mut self, fraction: f64) -> f64 {
        if fraction.is_finite() {
            self.fraction = self.fraction.max(fraction.clamp(0.0, 1.0));
        }
        self.fraction
    }

    /// Current fraction.
    pub fn fraction(&self) -> f64 {
        self.fraction
    }

    /// Remaining seconds at the current fraction.
    pub fn eta_secs(&self) -> Option<f64> {
        linear_eta(self.elapsed_secs(), self.fraction)
    }
}

/// Linear ETA: if `fraction` of the work took `elapsed_secs`, the rest takes
/// `elapsed / fraction - elapsed`. Undefined until some progress exists.
pub fn linear_eta(elapsed_secs: f64, fraction: f64) -> Option<f64> {
    if fraction <= 0.0 || !fraction.is_finite() || !elapsed_secs.is_finite() {
        return None;
    }
    if fraction >= 1.0 {
        return Some(0.0);
    }
    Some(((elapsed_secs / fraction) - elapsed_secs).max(0.0))
}

/// Emits at most one notification per `step` of progress.
///
/// With a step of 10% a full pass produces at most 11 notifications
/// (0%, 10%, ..., 100%), regardless of how often `should_notify` is called.
#[derive(Debug)]
pub struct StepNotifier {
    step_pct: u32,
    last_pct: Option<u32>,
}

impl StepNotifier {
    /// Create a notifier firing every `step_pct` percent (minimum 1).
    pub fn new(step_pct: u32) -> Self {
        Self {
            step_pct: step_pct.max(1),
            last_pct: None,
        }
    }

    /// Returns the percentage to report if `done / total` crossed the next step.
    pub fn should_notify(&mut self, done: u64, total: u64) -> Option<u32> {
        if total == 0 {
            return None;
        }
        let pct = ((done.min(total) as u128 * 100) / total as u128) as u32;
        match self.last_pct {
            Some(last) if pct < last + self.step_pct && pct != 100 => None,
            Some(last) if pct == last => None,
            _ => {
                let snapped = if pct == 100 { 100 } else { pct - pct % self.step_pct };
                self.last_pct = Some(snapped);
                Some(pct)
            }
        }
    }
}

/// Format seconds as `1h 02m`, `3m 07s` or `12s`.
pub fn format_duration(secs: f64) -> String {
    let total = Duration::from_secs_f64(secs.max(0.0)).as_secs();
    let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
    if h > 0 {
        format!("{h}h {m:02}m")
    } else if m > 0 {
        format!("{m}m {s:02}s")
    } else {
        format!("{s}s")
    }
}
