//! Per-client sliding-window request limiter for the HTTP boundary.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{interval, Instant};
use tracing::debug;

/// Allows `limit` requests per client in any trailing `window`.
#[derive(Debug)]
pub struct RateLimiter {
    limit: usize,
    window: Duration,
    clients: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit: limit as usize,
            window,
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub fn per_minute(limit: u32) -> Self {
        Self::new(limit, Duration::from_secs(60))
    }

    /// Record a request from `client`. On refusal returns how long until the
    /// oldest request leaves the window.
    pub async fn check(&self, client: &str) -> Result<(), Duration> {
        let now = Instant::now();
        let mut clients = self.clients.lock().await;
        let hits = clients.entry(client.to_string()).or_default();

        while hits
            .front()
            .is_some_and(|t| now.duration_since(*t) >= self.window)
        {
            hits.pop_front();
        }

        if hits.len() >= self.limit {
            let retry_after = hits
                .front()
                .map(|oldest| self.window.saturating_sub(now.duration_since(*oldest)))
                .unwrap_or(self.window);
            return Err(retry_after);
        }

        hits.push_back(now);
        Ok(())
    }

    /// Forget clients with no request inside the window.
    pub async fn evict_idle(&self) {
        let now = Instant::now();
        let mut clients = self.clients.lock().await;
        let before = clients.len();
        clients.retain(|_, hits| {
            hits.back()
                .is_some_and(|t| now.duration_since(*t) < self.window)
        });
        let evicted = before - clients.len();
        if evicted > 0 {
            debug!(evicted, "evicted idle rate-limit entries");
        }
    }

    pub async fn tracked_clients(&self) -> usize {
        self.clients.lock().await.len()
    }
}

/// Run [`RateLimiter::evict_idle`] once per window for the life of the process.
pub fn spawn_eviction(limiter: Arc<RateLimiter>) {
    tokio::spawn(async move {
        let mut ticker = interval(limiter.window);
        loop {
            ticker.tick().await;
            limiter.evict_idle().await;
        }
    });
}
