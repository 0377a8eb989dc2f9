//! Per-model rate limiting of progress notifications.
//!
//! The throttler only decides whether an update is forwarded to observers.
//! Callers keep the value either way.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Progress change that is always forwarded regardless of elapsed time.
pub const MIN_PROGRESS_DELTA: f64 = 0.01;

/// Float slack so a delta of exactly one percent is never lost to rounding.
const DELTA_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy)]
struct Accepted {
    at: Instant,
    progress: f64,
}

/// Decides which progress updates reach observers.
#[derive(Debug)]
pub struct ProgressThrottler {
    interval: Duration,
    accepted: Mutex<HashMap<String, Accepted>>,
}

impl ProgressThrottler {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            accepted: Mutex::new(HashMap::new()),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Whether `progress` (in `[0, 1]`) for `id` should be forwarded.
    ///
    /// Boundary values and the first update for an id always pass. Otherwise
    /// an update passes once the interval has elapsed since the last accepted
    /// one, or when progress moved by at least [`MIN_PROGRESS_DELTA`].
    pub fn should_update(&self, id: &str, progress: f64) -> bool {
        let now = Instant::now();
        let mut accepted = self.accepted.lock().expect("throttle lock poisoned");

        let forward = if progress == 0.0 || progress == 1.0 {
            true
        } else {
            match accepted.get(id) {
                None => true,
                Some(last) => {
                    now.duration_since(last.at) > self.interval
                        || (progress - last.progress).abs() + DELTA_EPSILON >= MIN_PROGRESS_DELTA
                }
            }
        };

        if forward {
            accepted.insert(id.to_string(), Accepted { at: now, progress });
        }
        forward
    }

    /// Forget the last accepted update so the next call counts as the first.
    pub fn reset(&self, id: &str) {
        self.accepted
            .lock()
            .expect("throttle lock poisoned")
            .remove(id);
    }

    /// Drop all tracking for `id`.
    pub fn cleanup(&self, id: &str) {
        self.accepted
            .lock()
            .expect("throttle lock poisoned")
            .remove(id);
    }

    /// Number of ids currently tracked.
    pub fn tracked(&self) -> usize {
        self.accepted.lock().expect("throttle lock poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn throttler() -> ProgressThrottler {
        ProgressThrottler::new(Duration::from_millis(250))
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_update_always_passes() {
        let t = throttler();
        assert!(t.should_update("a", 0.42));
        assert!(!t.should_update("a", 0.425));
    }

    #[tokio::test(start_paused = true)]
    async fn test_boundaries_always_pass() {
        let t = throttler();
        assert!(t.should_update("a", 0.5));
        assert!(t.should_update("a", 0.0));
        assert!(t.should_update("a", 1.0));
        assert!(t.should_update("a", 1.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_small_delta_waits_for_interval() {
        let t = throttler();
        assert!(t.should_update("a", 0.100));
        assert!(!t.should_update("a", 0.105));

        tokio::time::advance(Duration::from_millis(200)).await;
        assert!(!t.should_update("a", 0.106));

        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(t.should_update("a", 0.107));
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_percent_jump_passes_immediately() {
        let t = throttler();
        assert!(t.should_update("a", 0.10));
        assert!(t.should_update("a", 0.11));
        assert!(!t.should_update("a", 0.115));
        assert!(t.should_update("a", 0.12));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ids_are_independent() {
        let t = throttler();
        assert!(t.should_update("a", 0.3));
        assert!(t.should_update("b", 0.3));
        assert!(!t.should_update("a", 0.301));
        assert_eq!(t.tracked(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_and_cleanup() {
        let t = throttler();
        assert!(t.should_update("a", 0.3));
        assert!(!t.should_update("a", 0.301));

        t.reset("a");
        assert!(t.should_update("a", 0.302));

        t.cleanup("a");
        assert_eq!(t.tracked(), 0);
    }
}
