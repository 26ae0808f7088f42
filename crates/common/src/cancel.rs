//! Cooperative cancellation shared between the orchestrator and blocking stages.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Interval at which blocking stages re-check the flag.
pub const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// A cloneable, job-scoped cancellation signal.
///
/// Every clone observes the same flag. A fresh flag is created for each job
/// run, so cancelling one job never leaks into the next.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag {
    inner: Arc<AtomicBool>,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.inner.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.load(Ordering::SeqCst)
    }

    /// Sleep up to `timeout`, waking early once cancelled.
    /// Returns true if the flag was set.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let step = Duration::from_millis(25);
        let deadline = std::time::Instant::now() + timeout;
        while std::time::Instant::now() < deadline {
            if self.is_cancelled() {
                return true;
            }
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            std::thread::sleep(step.min(remaining));
        }
        self.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_state() {
        let flag = CancelFlag::new();
        let other = flag.clone();
        assert!(!other.is_cancelled());
        flag.cancel();
        assert!(other.is_cancelled());
    }

    #[test]
    fn test_wait_timeout_wakes_early() {
        let flag = CancelFlag::new();
        let remote = flag.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            remote.cancel();
        });
        let started = std::time::Instant::now();
        assert!(flag.wait_timeout(Duration::from_secs(5)));
        assert!(started.elapsed() < Duration::from_secs(1));
        handle.join().unwrap();
    }
}
