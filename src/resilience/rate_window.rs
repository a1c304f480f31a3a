//! Sliding-window request limiter keyed by client identity.
//!
//! Each key keeps the timestamps of its admitted requests. Expired
//! timestamps are evicted lazily when that key is touched, and a periodic
//! sweep drops keys that have gone quiet.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::debug;

/// Horizon used by the housekeeping sweep, independent of any caller window.
pub const SWEEP_HORIZON: Duration = Duration::from_secs(300);

/// Per-key sliding-window limiter.
#[derive(Debug, Default)]
pub struct RateWindowLimiter {
    windows: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateWindowLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit one request for `key` if fewer than `max_requests` were
    /// admitted within the trailing `window`.
    pub async fn admit(&self, key: &str, max_requests: usize, window: Duration) -> bool {
        self.admit_at(key, max_requests, window, Instant::now()).await
    }

    /// [`admit`](Self::admit) with an explicit clock reading.
    pub async fn admit_at(
        &self,
        key: &str,
        max_requests: usize,
        window: Duration,
        now: Instant,
    ) -> bool {
        let mut windows = self.windows.lock().await;
        let stamps = windows.entry(key.to_string()).or_default();
        evict_older_than(stamps, now, window);

        if stamps.len() < max_requests {
            stamps.push_back(now);
            true
        } else {
            debug!(key, max_requests, window_secs = window.as_secs(), "Request over limit");
            false
        }
    }

    /// Drop timestamps past the sweep horizon and forget empty keys.
    pub async fn clear_old_entries(&self) {
        self.clear_old_entries_at(Instant::now()).await;
    }

    pub async fn clear_old_entries_at(&self, now: Instant) {
        let mut windows = self.windows.lock().await;
        let before = windows.len();
        windows.retain(|_, stamps| {
            evict_older_than(stamps, now, SWEEP_HORIZON);
            !stamps.is_empty()
        });
        let removed = before - windows.len();
        if removed > 0 {
            debug!(removed, remaining = windows.len(), "Swept idle rate-limit keys");
        }
    }

    /// Number of keys currently tracked.
    pub async fn tracked_keys(&self) -> usize {
        self.windows.lock().await.len()
    }
}

fn evict_older_than(stamps: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    // Admission order keeps the deque sorted, so expired entries sit at the front.
    while let Some(front) = stamps.front() {
        if now.saturating_duration_since(*front) >= window {
            stamps.pop_front();
        } else {
            break;
        }
    }
}

/// Spawn the periodic sweep. The first tick is skipped.
pub fn spawn_sweep_task(
    limiter: Arc<RateWindowLimiter>,
    every: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.tick().await;
        loop {
            interval.tick().await;
            limiter.clear_old_entries().await;
        }
    })
}
