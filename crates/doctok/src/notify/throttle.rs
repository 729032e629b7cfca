use core::time::Duration;
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::time::Instant;

/// Default minimum interval between two throttled messages with the same key.
pub const THROTTLE_PERIOD: Duration = Duration::from_secs(5);

/// Per-key rate limiter: at most one acquisition per key per period.
///
/// Acquisitions that fall inside the window are dropped, never queued.
#[derive(Debug)]
pub struct Throttle {
    period: Duration,
    last: Mutex<HashMap<String, Instant>>,
}

impl Throttle {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            last: Mutex::default(),
        }
    }

    /// Returns `true` if a message for `key` may be sent now and records the
    /// send time. Keys whose window has closed are forgotten.
    pub fn try_acquire(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut last = self.last.lock();
        last.retain(|_, at| now.duration_since(*at) < self.period);
        if last.contains_key(key) {
            return false;
        }
        last.insert(key.to_owned(), now);
        true
    }
}

impl Default for Throttle {
    fn default() -> Self {
        Self::new(THROTTLE_PERIOD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn drops_inside_window_and_reopens_after() {
        let throttle = Throttle::default();

        assert!(throttle.try_acquire("a"));
        assert!(!throttle.try_acquire("a"));
        assert!(throttle.try_acquire("b"));

        tokio::time::advance(Duration::from_millis(4_999)).await;
        assert!(!throttle.try_acquire("a"));

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(throttle.try_acquire("a"));
        assert!(!throttle.try_acquire("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn forgets_keys_once_their_window_closes() {
        let throttle = Throttle::new(Duration::from_secs(1));
        for task in 0..100 {
            assert!(throttle.try_acquire(&format!("task-{task}")));
        }
        assert_eq!(throttle.last.lock().len(), 100);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(throttle.try_acquire("task-0"));
        assert_eq!(throttle.last.lock().len(), 1);
        assert!(!throttle.try_acquire("task-0"));
    }
}
