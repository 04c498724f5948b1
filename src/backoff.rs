//! Respawn backoff for crash-looping workers

use rand::Rng;
use std::time::Duration;

/// Exponential backoff with jitter, driven by consecutive fast exits
#[derive(Debug, Clone)]
pub struct RestartBackoff {
    base: Duration,
    max: Duration,
    /// Exits sooner than this after spawn count as crashes
    min_uptime: Duration,
    consecutive_crashes: u32,
}

impl RestartBackoff {
    pub fn new(base: Duration, max: Duration, min_uptime: Duration) -> Self {
        Self {
            base,
            max,
            min_uptime,
            consecutive_crashes: 0,
        }
    }

    /// Record how long the previous incarnation ran and return the delay
    /// before spawning the next one
    ///
    /// A worker that stayed up for at least `min_uptime` resets the streak and
    /// is replaced immediately.
    pub fn on_exit(&mut self, uptime: Duration) -> Duration {
        if uptime >= self.min_uptime {
            self.consecutive_crashes = 0;
            return Duration::ZERO;
        }
        self.on_crash()
    }

    /// Record a crash (including a failed spawn) and return the delay
    pub fn on_crash(&mut self) -> Duration {
        self.consecutive_crashes = self.consecutive_crashes.saturating_add(1);
        calculate_backoff(self.consecutive_crashes, self.base, self.max)
    }

    pub fn consecutive_crashes(&self) -> u32 {
        self.consecutive_crashes
    }
}

/// Delay for the given attempt (1-based): base * 2^(attempt-1), capped at
/// `max`, plus up to 10% jitter
pub fn calculate_backoff(attempt: u32, base: Duration, max: Duration) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }

    let base_ms = base.as_millis() as u64;
    let max_ms = max.as_millis() as u64;
    let exponential = 2u64.saturating_pow(attempt - 1);
    let capped = base_ms.saturating_mul(exponential).min(max_ms);

    let jitter_range = capped / 10;
    let jitter = if jitter_range > 0 {
        rand::thread_rng().gen_range(0..jitter_range)
    } else {
        0
    };

    Duration::from_millis(capped + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn within(delay: Duration, low_ms: u64) -> bool {
        let ms = delay.as_millis() as u64;
        ms >= low_ms && ms <= low_ms + low_ms / 10
    }

    #[test]
    fn test_backoff_calculation() {
        let base = Duration::from_millis(100);
        let max = Duration::from_millis(1000);

        assert_eq!(calculate_backoff(0, base, max), Duration::ZERO);
        assert!(within(calculate_backoff(1, base, max), 100));
        assert!(within(calculate_backoff(2, base, max), 200));
        assert!(within(calculate_backoff(3, base, max), 400));
        assert!(within(calculate_backoff(10, base, max), 1000));
        assert!(within(calculate_backoff(u32::MAX, base, max), 1000));
    }

    #[test]
    fn test_fast_exits_grow_the_delay() {
        let mut backoff = RestartBackoff::new(
            Duration::from_millis(100),
            Duration::from_secs(10),
            Duration::from_secs(1),
        );

        let first = backoff.on_exit(Duration::from_millis(10));
        let second = backoff.on_exit(Duration::from_millis(10));
        assert!(within(first, 100));
        assert!(within(second, 200));
        assert_eq!(backoff.consecutive_crashes(), 2);
    }

    #[test]
    fn test_long_uptime_resets_streak() {
        let mut backoff = RestartBackoff::new(
            Duration::from_millis(100),
            Duration::from_secs(10),
            Duration::from_secs(1),
        );

        backoff.on_crash();
        backoff.on_crash();
        assert_eq!(backoff.on_exit(Duration::from_secs(60)), Duration::ZERO);
        assert_eq!(backoff.consecutive_crashes(), 0);
        assert!(within(backoff.on_exit(Duration::ZERO), 100));
    }
}
