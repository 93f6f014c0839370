//! Command rate limiting.
//!
//! Two layers: a fixed 1000 ms window per device and a global token bucket
//! refilled at `max_commands_per_second` up to `burst_size`.

use std::collections::HashMap;
use std::time::Duration;

use habitat_core::config::defaults;
use habitat_core::RateLimitConfig;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
struct Window {
    count: u32,
    reset_at: Instant,
}

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: u32, refill_per_sec: u32, now: Instant) -> Self {
        Self {
            tokens: f64::from(capacity),
            capacity: f64::from(capacity),
            refill_per_sec: f64::from(refill_per_sec),
            last_refill: now,
        }
    }

    fn try_take(&mut self, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[derive(Debug)]
pub struct RateLimiter {
    enabled: bool,
    per_device: u32,
    window: Duration,
    devices: HashMap<String, Window>,
    global: TokenBucket,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            enabled: config.enabled,
            per_device: config.max_commands_per_device,
            window: Duration::from_millis(defaults::RATE_LIMIT_WINDOW_MS),
            devices: HashMap::new(),
            global: TokenBucket::new(config.burst_size, config.max_commands_per_second, Instant::now()),
        }
    }

    /// Count a command for `device_id`; `false` when it must be rejected.
    pub fn check(&mut self, device_id: &str, now: Instant) -> bool {
        if !self.enabled {
            return true;
        }

        let window = self.window;
        let entry = self.devices.entry(device_id.to_string()).or_insert(Window {
            count: 0,
            reset_at: now + window,
        });
        if now > entry.reset_at {
            *entry = Window {
                count: 0,
                reset_at: now + window,
            };
        }
        if entry.count >= self.per_device {
            return false;
        }

        if !self.global.try_take(now) {
            return false;
        }
        entry.count += 1;
        true
    }

    /// Drop expired windows.
    pub fn cleanup(&mut self, now: Instant) {
        self.devices.retain(|_, window| now <= window.reset_at);
    }

    pub fn tracked_devices(&self) -> usize {
        self.devices.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(per_device: u32, per_second: u32, burst: u32) -> RateLimiter {
        RateLimiter::new(&RateLimitConfig {
            enabled: true,
            max_commands_per_device: per_device,
            max_commands_per_second: per_second,
            burst_size: burst,
        })
    }

    #[test]
    fn test_per_device_window() {
        let mut rl = limiter(2, 100, 200);
        let start = Instant::now();
        assert!(rl.check("lamp", start));
        assert!(rl.check("lamp", start));
        assert!(!rl.check("lamp", start + Duration::from_millis(500)));
        assert!(rl.check("fan", start));

        assert!(rl.check("lamp", start + Duration::from_millis(1001)));
    }

    #[test]
    fn test_global_bucket() {
        let mut rl = limiter(100, 10, 3);
        let start = Instant::now();
        for i in 0..3 {
            assert!(rl.check(&format!("d{}", i), start));
        }
        assert!(!rl.check("d9", start));
        // One token back after 150 ms at 10/s.
        assert!(rl.check("d9", start + Duration::from_millis(150)));
        assert!(!rl.check("d10", start + Duration::from_millis(150)));
    }

    #[test]
    fn test_disabled() {
        let mut rl = RateLimiter::new(&RateLimitConfig {
            enabled: false,
            max_commands_per_device: 1,
            ..RateLimitConfig::default()
        });
        let now = Instant::now();
        assert!(rl.check("lamp", now));
        assert!(rl.check("lamp", now));
    }

    #[test]
    fn test_cleanup() {
        let mut rl = limiter(5, 100, 200);
        let start = Instant::now();
        rl.check("a", start);
        rl.check("b", start + Duration::from_millis(800));
        rl.cleanup(start + Duration::from_millis(1200));
        assert_eq!(rl.tracked_devices(), 1);
    }
}
