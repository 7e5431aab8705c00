//! Platform-wide advisory throttle shared by all buckets.

use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Requests fired within the current one-second accounting window
#[derive(Debug)]
struct FiredWindow {
    started: Instant,
    count: u32,
}

/// Tracks the single global throttle window every bucket consults before
/// admitting a request.
///
/// Two inputs engage it: a response flagged as a global throttle (with a
/// server-declared deadline), and the fired-request heuristic — once the
/// configured ceiling of calls in one second is reached, the limiter
/// self-engages for the remainder of that window. The window is cleared
/// lazily on the next query once its deadline has passed; no timer callback
/// is involved.
#[derive(Debug)]
pub(crate) struct GlobalLimiter {
    reset_at: Mutex<Option<Instant>>,
    fired: Mutex<FiredWindow>,
    max_per_second: u32,
}

impl GlobalLimiter {
    pub(crate) fn new(max_per_second: u32) -> Self {
        Self {
            reset_at: Mutex::new(None),
            fired: Mutex::new(FiredWindow {
                started: Instant::now(),
                count: 0,
            }),
            max_per_second,
        }
    }

    /// Whether the global throttle is currently engaged
    pub(crate) fn is_limited(&self) -> bool {
        self.limited_until().is_some()
    }

    /// Deadline of the current throttle window, clearing it lazily if it has
    /// already passed
    pub(crate) fn limited_until(&self) -> Option<Instant> {
        let mut reset_at = self.reset_at.lock().unwrap();
        match *reset_at {
            Some(at) if at > Instant::now() => Some(at),
            _ => {
                *reset_at = None;
                None
            }
        }
    }

    /// Record a new throttle window. Only extends: a deadline earlier than
    /// the currently tracked one is ignored.
    pub(crate) fn engage(&self, until: Instant) {
        let mut reset_at = self.reset_at.lock().unwrap();
        if reset_at.is_none_or(|current| until > current) {
            log::debug!(
                "Global rate limit engaged for {:.2}s",
                until.saturating_duration_since(Instant::now()).as_secs_f64()
            );
            *reset_at = Some(until);
        }
    }

    /// Record that a call fired. When the per-second ceiling is reached the
    /// limiter engages itself until the accounting window ends.
    pub(crate) fn fired(&self) {
        if self.max_per_second == 0 {
            return;
        }

        let window_end = {
            let mut fired = self.fired.lock().unwrap();
            let now = Instant::now();
            if now.duration_since(fired.started) >= Duration::from_secs(1) {
                fired.started = now;
                fired.count = 0;
            }
            fired.count += 1;
            (fired.count >= self.max_per_second).then_some(fired.started + Duration::from_secs(1))
        };

        if let Some(until) = window_end {
            self.engage(until);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_engage_and_lazy_clear() {
        let limiter = GlobalLimiter::new(50);
        assert!(!limiter.is_limited());

        limiter.engage(Instant::now() + Duration::from_secs(2));
        assert!(limiter.is_limited());

        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(!limiter.is_limited());
    }

    #[tokio::test(start_paused = true)]
    async fn test_engage_only_extends() {
        let limiter = GlobalLimiter::new(50);
        let far = Instant::now() + Duration::from_secs(10);
        limiter.engage(far);

        // A shorter window must not shrink the tracked one
        limiter.engage(Instant::now() + Duration::from_secs(1));
        assert_eq!(limiter.limited_until(), Some(far));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fired_ceiling_self_engages() {
        let limiter = GlobalLimiter::new(3);
        limiter.fired();
        limiter.fired();
        assert!(!limiter.is_limited());

        limiter.fired();
        assert!(limiter.is_limited());

        // Next window starts clean
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(!limiter.is_limited());
        limiter.fired();
        assert!(!limiter.is_limited());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_ceiling_disables_heuristic() {
        let limiter = GlobalLimiter::new(0);
        for _ in 0..100 {
            limiter.fired();
        }
        assert!(!limiter.is_limited());
    }
}
