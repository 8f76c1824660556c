use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

const PRUNE_THRESHOLD: usize = 1024;

#[derive(Debug, Clone, Copy)]
struct Window {
    start: DateTime<Utc>,
    count: u32,
}

/// Fixed-window request counter keyed by client address. Windows start at the
/// first request in the window, not on calendar boundaries. In-process only;
/// state resets on restart.
pub struct FixedWindowLimiter {
    max: u32,
    window: Duration,
    windows: HashMap<String, Window>,
}

impl FixedWindowLimiter {
    pub fn new(max: u32, window_seconds: i64) -> Self {
        Self {
            max,
            window: Duration::seconds(window_seconds),
            windows: HashMap::new(),
        }
    }

    /// Registers one request for `key`. Returns `Err(retry_after_seconds)`
    /// once the ceiling for the current window is reached.
    pub fn check(&mut self, key: &str, now: DateTime<Utc>) -> Result<(), u64> {
        if self.windows.len() > PRUNE_THRESHOLD {
            let window = self.window;
            self.windows.retain(|_, w| now - w.start < window);
        }

        let entry = self
            .windows
            .entry(key.to_string())
            .or_insert(Window { start: now, count: 0 });

        if now - entry.start >= self.window {
            entry.start = now;
            entry.count = 0;
        }

        if entry.count >= self.max {
            let reset_at = entry.start + self.window;
            return Err((reset_at - now).num_seconds().max(1) as u64);
        }

        entry.count += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_once_ceiling_is_reached() {
        let mut limiter = FixedWindowLimiter::new(20, 3600);
        let now = Utc::now();

        for _ in 0..20 {
            assert!(limiter.check("10.0.0.1", now).is_ok());
        }

        let retry_after = limiter.check("10.0.0.1", now).unwrap_err();
        assert!(retry_after >= 1 && retry_after <= 3600);
    }

    #[test]
    fn window_rollover_admits_again() {
        let mut limiter = FixedWindowLimiter::new(2, 3600);
        let now = Utc::now();

        assert!(limiter.check("10.0.0.1", now).is_ok());
        assert!(limiter.check("10.0.0.1", now).is_ok());
        assert!(limiter.check("10.0.0.1", now).is_err());

        let later = now + Duration::seconds(3601);
        assert!(limiter.check("10.0.0.1", later).is_ok());
    }

    #[test]
    fn retry_after_counts_down_to_window_end() {
        let mut limiter = FixedWindowLimiter::new(1, 3600);
        let now = Utc::now();

        assert!(limiter.check("10.0.0.1", now).is_ok());
        let retry_after = limiter
            .check("10.0.0.1", now + Duration::seconds(600))
            .unwrap_err();
        assert_eq!(retry_after, 3000);
    }

    #[test]
    fn clients_are_counted_independently() {
        let mut limiter = FixedWindowLimiter::new(1, 3600);
        let now = Utc::now();

        assert!(limiter.check("10.0.0.1", now).is_ok());
        assert!(limiter.check("10.0.0.2", now).is_ok());
        assert!(limiter.check("10.0.0.1", now).is_err());
    }
}
