use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use uuid::Uuid;

use vesper_types::error::SendError;

/// Default window: 20 sends per 60 seconds per sender.
pub const DEFAULT_MAX_PER_WINDOW: usize = 20;
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

/// Sliding-window burst throttle, per sender. Independent of the
/// one-message request limit: this throttles bursts, the request limit
/// throttles unsolicited contact.
///
/// State is instance-scoped: a map from sender id to recent send
/// timestamps, pruned lazily on each admit.
pub struct RateLimiter {
    max_per_window: usize,
    window: Duration,
    recent: Mutex<HashMap<Uuid, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(max_per_window: usize, window: Duration) -> Self {
        Self {
            max_per_window,
            window,
            recent: Mutex::new(HashMap::new()),
        }
    }

    pub fn admit(&self, sender_id: Uuid) -> Result<(), SendError> {
        self.admit_at(sender_id, Instant::now())
    }

    /// Admission with an explicit clock, for tests.
    pub fn admit_at(&self, sender_id: Uuid, now: Instant) -> Result<(), SendError> {
        let mut recent = self.recent.lock().expect("rate limiter lock poisoned");
        let stamps = recent.entry(sender_id).or_default();

        while let Some(&front) = stamps.front() {
            if now.duration_since(front) >= self.window {
                stamps.pop_front();
            } else {
                break;
            }
        }

        if stamps.len() >= self.max_per_window {
            // Oldest stamp leaving the window frees a slot.
            let oldest = *stamps.front().expect("non-empty at capacity");
            let retry_after = self.window.saturating_sub(now.duration_since(oldest));
            return Err(SendError::RateLimited { retry_after });
        }

        stamps.push_back(now);
        Ok(())
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PER_WINDOW, DEFAULT_WINDOW)
    }
}
