//! Application state and rate limiting.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use timebank_engine::Engine;
use timebank_storage::MemoryStorage;
use tokio::sync::Mutex;

use super::RATE_LIMIT_WINDOW_SECS;

/// Per-IP request windows: (request count, window start time).
struct IpTracker {
    clients: HashMap<IpAddr, (u64, Instant)>,
    last_prune: Instant,
}

/// In-memory per-IP rate limiter.
pub(crate) struct RateLimiter {
    tracker: Mutex<IpTracker>,
    /// Maximum requests per window.
    pub(crate) max_requests: u64,
    window: Duration,
}

impl RateLimiter {
    pub(crate) fn new(max_requests: u64) -> Self {
        Self::with_window(max_requests, Duration::from_secs(RATE_LIMIT_WINDOW_SECS))
    }

    pub(crate) fn with_window(max_requests: u64, window: Duration) -> Self {
        Self {
            tracker: Mutex::new(IpTracker {
                clients: HashMap::new(),
                last_prune: Instant::now(),
            }),
            max_requests,
            window,
        }
    }

    /// Check if a request from the given IP is allowed.
    /// Returns Ok(()) if allowed, Err(retry_after_secs) if rate limited.
    pub(crate) async fn check(&self, ip: IpAddr) -> Result<(), u64> {
        let mut tracker = self.tracker.lock().await;
        let now = Instant::now();

        // Drop expired windows at most once per window.
        if now.duration_since(tracker.last_prune) >= self.window {
            let window = self.window;
            tracker
                .clients
                .retain(|_, (_, start)| now.duration_since(*start) < window);
            tracker.last_prune = now;
        }

        let entry = tracker.clients.entry(ip).or_insert((0, now));

        // Reset window if expired
        let elapsed = now.duration_since(entry.1);
        if elapsed >= self.window {
            entry.0 = 0;
            entry.1 = now;
        }

        entry.0 += 1;
        if entry.0 > self.max_requests {
            Err(self.window.saturating_sub(elapsed).as_secs().max(1))
        } else {
            Ok(())
        }
    }

    #[cfg(test)]
    pub(crate) async fn tracked_clients(&self) -> usize {
        self.tracker.lock().await.clients.len()
    }
}

/// Application state shared across request handlers.
pub(crate) struct AppState {
    pub(crate) engine: Arc<Engine<MemoryStorage>>,
    pub(crate) rate_limiter: RateLimiter,
    /// Optional API key for authentication. None = no auth required.
    pub(crate) api_key: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn limiter_counts_per_ip() {
        let limiter = RateLimiter::new(2);
        let a = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let b = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));
        assert!(limiter.check(a).await.is_ok());
        assert!(limiter.check(a).await.is_ok());
        let retry = limiter.check(a).await.unwrap_err();
        assert!(retry <= RATE_LIMIT_WINDOW_SECS);
        assert!(limiter.check(b).await.is_ok());
    }

    #[tokio::test]
    async fn expired_windows_are_dropped() {
        let limiter = RateLimiter::with_window(5, Duration::from_millis(20));
        for last in 1..=3 {
            let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, last));
            assert!(limiter.check(ip).await.is_ok());
        }
        assert_eq!(limiter.tracked_clients().await, 3);

        tokio::time::sleep(Duration::from_millis(40)).await;
        let fresh = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9));
        assert!(limiter.check(fresh).await.is_ok());
        assert_eq!(limiter.tracked_clients().await, 1);
    }
}
