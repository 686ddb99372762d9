//! Sliding-window per-IP rate limiting
//! Counts reset on process restart; nothing is persisted

use dashmap::DashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Sliding-window request counter keyed by client IP.
///
/// Each IP owns an ordered list of request instants. A check prunes the
/// list to the current window, rejects if the remaining count has reached
/// the limit, and records the attempt otherwise. Rejected attempts are not
/// recorded, so a rejected burst does not extend the lockout.
///
/// The map shards serialize concurrent checks for the same IP, so bursts
/// from one address cannot lose or double a count.
pub struct RateLimiter {
    records: DashMap<IpAddr, Vec<Instant>>,
    window: Duration,
    max_requests: usize,
}

impl RateLimiter {
    pub fn new(window: Duration, max_requests: usize) -> Self {
        Self {
            records: DashMap::new(),
            window,
            max_requests,
        }
    }

    /// Check and record a request from `ip`. Returns false when the IP has
    /// exhausted its quota for the current window.
    pub fn allow(&self, ip: IpAddr) -> bool {
        self.allow_at(ip, Instant::now())
    }

    fn allow_at(&self, ip: IpAddr, now: Instant) -> bool {
        let mut timestamps = self.records.entry(ip).or_default();

        if let Some(cutoff) = now.checked_sub(self.window) {
            timestamps.retain(|&t| t > cutoff);
        }

        if timestamps.len() >= self.max_requests {
            return false;
        }

        timestamps.push(now);
        true
    }

    /// Drop IP entries whose newest request has aged out of the window.
    /// Bounds memory without touching records still in use.
    pub fn sweep(&self) {
        self.sweep_at(Instant::now());
    }

    fn sweep_at(&self, now: Instant) {
        let Some(cutoff) = now.checked_sub(self.window) else {
            return;
        };

        let before = self.records.len();
        self.records.retain(|_, timestamps| {
            timestamps.last().is_some_and(|&newest| newest > cutoff)
        });
        let removed = before - self.records.len();

        if removed > 0 {
            debug!("Rate limiter sweep removed {} idle entries", removed);
        }
    }

    /// Periodic background sweep. Runs until the task is dropped; never
    /// holds a map lock across an await.
    pub async fn run_sweeper(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        // The first tick fires immediately; skip it so startup stays quiet.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            self.sweep();
        }
    }

    #[cfg(test)]
    fn tracked_ips(&self) -> usize {
        self.records.len()
    }
}
