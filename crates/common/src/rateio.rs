//! Rate-limited I/O budgets.
//!
//! Scanning and network delivery each get a budget derived from a one-time
//! measured device capacity scaled by a configured percentage. The limiter
//! enforces both a bytes-per-second and an operations-per-second ceiling by
//! sleeping whenever consumption runs ahead of wall-clock time. The sleeps
//! are the backpressure that keeps scanning from starving foreground I/O.

use std::time::Duration;

use tokio::time::Instant;

/// Measured capacity of a device plus the configured scaling percentage.
/// The percentage is hot-reloadable; callers take a [`RateLimiter`] snapshot
/// at the start of each throttled operation.
#[derive(Debug, Clone)]
pub struct RateContext {
    capacity_bytes_per_second: u64,
    capacity_blocks_per_second: u64,
    speed_percent: u64,
}

impl RateContext {
    pub fn new(
        capacity_bytes_per_second: u64,
        capacity_blocks_per_second: u64,
        speed_percent: u64,
    ) -> Self {
        Self {
            capacity_bytes_per_second,
            capacity_blocks_per_second,
            speed_percent: speed_percent.min(100),
        }
    }

    /// A context with no ceilings; throttle calls return immediately.
    pub fn unlimited() -> Self {
        Self::new(0, 0, 100)
    }

    pub fn set_speed_percent(&mut self, percent: u64) {
        self.speed_percent = percent.min(100);
    }

    pub fn speed_percent(&self) -> u64 {
        self.speed_percent
    }

    /// Effective ceilings after percentage scaling. Zero means unlimited.
    pub fn limits(&self) -> (u64, u64) {
        (
            self.capacity_bytes_per_second * self.speed_percent / 100,
            self.capacity_blocks_per_second * self.speed_percent / 100,
        )
    }

    /// Start a limiter for one operation (a scan cycle, one delivery).
    pub fn limiter(&self) -> RateLimiter {
        let (bytes, blocks) = self.limits();
        RateLimiter::new(bytes, blocks)
    }
}

/// Tracks consumption against byte and block ceilings from a fixed start
/// instant. `throttle` sleeps just long enough that total consumption never
/// exceeds either ceiling, which gives the monotonic floor: processing N
/// bytes at B bytes/sec takes at least N/B seconds of wall clock.
#[derive(Debug)]
pub struct RateLimiter {
    started: Instant,
    bytes_per_second: u64,
    blocks_per_second: u64,
    bytes: u64,
    blocks: u64,
}

impl RateLimiter {
    /// Ceilings of zero disable the corresponding budget.
    pub fn new(bytes_per_second: u64, blocks_per_second: u64) -> Self {
        Self {
            started: Instant::now(),
            bytes_per_second,
            blocks_per_second,
            bytes: 0,
            blocks: 0,
        }
    }

    pub fn unlimited() -> Self {
        Self::new(0, 0)
    }

    /// Account for `bytes` read in `blocks` operations, sleeping if either
    /// budget has been consumed faster than wall-clock time allows.
    pub async fn throttle(&mut self, bytes: u64, blocks: u64) {
        self.bytes += bytes;
        self.blocks += blocks;
        let mut required = Duration::ZERO;
        if self.bytes_per_second > 0 {
            required = required.max(Duration::from_secs_f64(
                self.bytes as f64 / self.bytes_per_second as f64,
            ));
        }
        if self.blocks_per_second > 0 {
            required = required.max(Duration::from_secs_f64(
                self.blocks as f64 / self.blocks_per_second as f64,
            ));
        }
        let elapsed = self.started.elapsed();
        if required > elapsed {
            tokio::time::sleep(required - elapsed).await;
        }
    }

    pub fn bytes_consumed(&self) -> u64 {
        self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wall_clock_floor_holds() {
        // 16 KiB at 32 KiB/sec must take at least half a second, however
        // fast the "device" is.
        let mut limiter = RateLimiter::new(32 * 1024, 0);
        let started = std::time::Instant::now();
        for _ in 0..16 {
            limiter.throttle(1024, 1).await;
        }
        assert!(started.elapsed() >= Duration::from_millis(500));
    }

    #[tokio::test]
    async fn block_budget_also_binds() {
        // 8 ops at 16 ops/sec is a 500ms floor even with tiny byte counts.
        let mut limiter = RateLimiter::new(0, 16);
        let started = std::time::Instant::now();
        for _ in 0..8 {
            limiter.throttle(1, 1).await;
        }
        assert!(started.elapsed() >= Duration::from_millis(500));
    }

    #[tokio::test]
    async fn unlimited_does_not_sleep() {
        let mut limiter = RateLimiter::unlimited();
        let started = std::time::Instant::now();
        limiter.throttle(u64::MAX / 2, 1_000_000).await;
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn percent_scaling() {
        let mut context = RateContext::new(1_000_000, 10_000, 2);
        assert_eq!(context.limits(), (20_000, 200));
        context.set_speed_percent(50);
        assert_eq!(context.limits(), (500_000, 5_000));
        context.set_speed_percent(150);
        assert_eq!(context.speed_percent(), 100);
    }
}
