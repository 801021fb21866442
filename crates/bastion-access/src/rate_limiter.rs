//! Per-host sliding-window rate limiter.
//!
//! Each host keeps the timestamps of its admitted requests inside the
//! current window. Hosts whose newest timestamp has aged out of the window
//! are dropped on the next access, which bounds memory without a
//! background task.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use bastion_types::{NetworkPolicy, RateLimitMode};

/// Sliding-window rate limiter keyed by host.
#[derive(Debug)]
pub struct RateLimiter {
    limit: u32,
    window: Duration,
    mode: RateLimitMode,
    hosts: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    /// Creates a limiter admitting `limit` requests per host per `window`
    /// (0 = unlimited).
    pub fn new(limit: u32, window: Duration, mode: RateLimitMode) -> Self {
        Self {
            limit,
            window,
            mode,
            hosts: Mutex::new(HashMap::new()),
        }
    }

    /// Creates a limiter from the policy's rate settings.
    pub fn from_policy(policy: &NetworkPolicy) -> Self {
        Self::new(policy.rate_limit, policy.rate_window(), policy.rate_limit_mode)
    }

    /// Reaction to a full window.
    pub fn mode(&self) -> RateLimitMode {
        self.mode
    }

    /// Admits one request for `host` if the window has room.
    ///
    /// # Errors
    ///
    /// Returns how long until the oldest request leaves the window.
    pub fn try_acquire(&self, host: &str) -> Result<(), Duration> {
        if self.limit == 0 {
            return Ok(());
        }
        let now = Instant::now();
        let mut hosts = self.hosts.lock().unwrap_or_else(|e| e.into_inner());
        let window = self.window;
        hosts.retain(|h, stamps| {
            h == host || stamps.back().is_some_and(|t| now.duration_since(*t) < window)
        });
        let stamps = hosts.entry(host.to_string()).or_default();
        while stamps
            .front()
            .is_some_and(|t| now.duration_since(*t) >= window)
        {
            stamps.pop_front();
        }
        if stamps.len() < self.limit as usize {
            stamps.push_back(now);
            return Ok(());
        }
        let retry_after = stamps
            .front()
            .map(|oldest| window.saturating_sub(now.duration_since(*oldest)))
            .unwrap_or(window);
        Err(retry_after)
    }

    /// Admits one request, honoring the configured mode.
    ///
    /// In `Wait` mode this sleeps until the window slides. The lock is
    /// never held across the sleep.
    ///
    /// # Errors
    ///
    /// In `Reject` mode, returns the retry-after duration of a full window.
    pub async fn acquire(&self, host: &str) -> Result<(), Duration> {
        loop {
            match self.try_acquire(host) {
                Ok(()) => return Ok(()),
                Err(retry_after) if self.mode == RateLimitMode::Wait => {
                    tracing::debug!(host, ?retry_after, "rate limit reached, waiting");
                    tokio::time::sleep(retry_after.max(Duration::from_millis(1))).await;
                }
                Err(retry_after) => return Err(retry_after),
            }
        }
    }

    /// Number of hosts currently tracked.
    pub fn tracked_hosts(&self) -> usize {
        self.hosts.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}
