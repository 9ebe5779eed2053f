use std::collections::VecDeque;
use std::time::{Duration, Instant};

const MAX_WINDOW_ENTRIES: usize = 10_000; // Prevent unbounded growth

/// Sliding window rate limiter.
///
/// Unlike a fixed window that resets at fixed intervals, this tracks
/// individual event timestamps and only counts events within the sliding
/// window. This prevents "clock edge" bursts where a client sends the maximum
/// just before and after a window boundary.
#[derive(Debug)]
pub struct RateLimiter {
    window: Duration,
    limit: u32,
    /// Timestamps of accepted events, oldest first
    hits: VecDeque<Instant>,
}

impl RateLimiter {
    /// Creates a limiter allowing `limit` events per `window`.
    #[must_use]
    pub fn new(window: Duration, limit: u32) -> Self {
        Self {
            window,
            limit,
            hits: VecDeque::with_capacity(16),
        }
    }

    /// Creates a limiter allowing `limit` events per sliding minute.
    #[must_use]
    pub fn per_minute(limit: u32) -> Self {
        Self::new(Duration::from_secs(60), limit)
    }

    fn expire_old_entries(&mut self, now: Instant) {
        while let Some(&oldest) = self.hits.front() {
            if now.duration_since(oldest) >= self.window {
                self.hits.pop_front();
            } else {
                break;
            }
        }
    }

    fn count(&self) -> u32 {
        self.hits.len().try_into().unwrap_or(u32::MAX)
    }

    /// Check the limit and record the event in a single pass.
    /// Returns `true` if the event is allowed.
    pub fn check_and_record(&mut self) -> bool {
        self.check_and_record_at(Instant::now())
    }

    /// Same as [`check_and_record`](Self::check_and_record) with an explicit clock.
    pub fn check_and_record_at(&mut self, now: Instant) -> bool {
        self.expire_old_entries(now);
        if self.count() >= self.limit {
            return false;
        }
        self.hits.push_back(now);
        if self.hits.len() > MAX_WINDOW_ENTRIES {
            self.hits.pop_front();
        }
        true
    }

    /// Returns `true` if no event within the window is still counted at `now`.
    pub fn is_idle_at(&mut self, now: Instant) -> bool {
        self.expire_old_entries(now);
        self.hits.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_limit() {
        let mut limiter = RateLimiter::per_minute(3);
        assert!(limiter.check_and_record());
        assert!(limiter.check_and_record());
        assert!(limiter.check_and_record());
        assert!(!limiter.check_and_record());
        assert_eq!(limiter.count(), 3);
    }

    #[test]
    fn rejected_events_are_not_recorded() {
        let mut limiter = RateLimiter::per_minute(1);
        let now = Instant::now();
        assert!(limiter.check_and_record_at(now));
        for _ in 0..5 {
            assert!(!limiter.check_and_record_at(now));
        }
        assert_eq!(limiter.count(), 1);
    }

    #[test]
    fn old_entries_expire_after_window() {
        let mut limiter = RateLimiter::new(Duration::from_secs(10), 2);
        let start = Instant::now();
        assert!(limiter.check_and_record_at(start));
        assert!(limiter.check_and_record_at(start + Duration::from_secs(5)));
        assert!(!limiter.check_and_record_at(start + Duration::from_secs(9)));

        // First entry falls out of the window
        assert!(limiter.check_and_record_at(start + Duration::from_secs(10)));
        assert_eq!(limiter.count(), 2);
    }

    #[test]
    fn sliding_window_prevents_clock_edge_burst() {
        let mut limiter = RateLimiter::per_minute(60);
        let start = Instant::now();

        // Burst at the end of what a fixed window would consider minute one
        for i in 0..60 {
            assert!(limiter.check_and_record_at(start + Duration::from_millis(59_000 + i * 10)));
        }

        // Still 60 events within the last 60 seconds
        assert!(!limiter.check_and_record_at(start + Duration::from_secs(61)));
    }

    #[test]
    fn zero_limit_rejects_everything() {
        let mut limiter = RateLimiter::per_minute(0);
        assert!(!limiter.check_and_record());
    }

    #[test]
    fn idle_after_window_passes() {
        let mut limiter = RateLimiter::new(Duration::from_secs(1), 5);
        let start = Instant::now();
        assert!(limiter.is_idle_at(start));
        limiter.check_and_record_at(start);
        assert!(!limiter.is_idle_at(start));
        assert!(limiter.is_idle_at(start + Duration::from_secs(1)));
    }

    #[test]
    fn max_entries_prevents_unbounded_growth() {
        let mut limiter = RateLimiter::per_minute(u32::MAX);
        let now = Instant::now();
        for _ in 0..MAX_WINDOW_ENTRIES + 100 {
            limiter.check_and_record_at(now);
        }
        assert!(limiter.hits.len() <= MAX_WINDOW_ENTRIES);
    }
}
