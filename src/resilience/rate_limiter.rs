use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

/// Sliding-window request admission control, one window per identifier
/// (user id or client address).
///
/// Windows are pruned lazily on every check; a periodic [`prune_idle`] sweep
/// drops identifiers whose windows have gone empty so memory stays bounded.
///
/// [`prune_idle`]: RateLimiter::prune_idle
pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    windows: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Admit or deny one request for `identifier`, recording it if admitted.
    pub fn is_allowed(&self, identifier: &str) -> bool {
        let now = Instant::now();
        let mut windows = self.windows.lock().unwrap();
        let timestamps = windows.entry(identifier.to_string()).or_default();

        while let Some(&oldest) = timestamps.front() {
            if now.duration_since(oldest) >= self.window {
                timestamps.pop_front();
            } else {
                break;
            }
        }

        if timestamps.len() >= self.max_requests {
            return false;
        }
        timestamps.push_back(now);
        true
    }

    /// Drop identifiers whose windows contain no live timestamps.
    pub fn prune_idle(&self) {
        let now = Instant::now();
        let mut windows = self.windows.lock().unwrap();
        windows.retain(|_, timestamps| {
            while let Some(&oldest) = timestamps.front() {
                if now.duration_since(oldest) >= self.window {
                    timestamps.pop_front();
                } else {
                    break;
                }
            }
            !timestamps.is_empty()
        });
    }

    /// Number of identifiers currently tracked.
    pub fn tracked_identifiers(&self) -> usize {
        self.windows.lock().unwrap().len()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(100, Duration::from_secs(60))
    }
}
