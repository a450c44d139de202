use std::time::{Duration, Instant};

use ahash::AHashMap;
use parking_lot::Mutex;

struct Bucket {
    count: usize,
    reset_at: Instant,
}

/// A fixed-window request counter keyed by an opaque string.
///
/// Counting is monotonic within a window; an expired bucket is reset
/// lazily on the next admission attempt. Keys are fully independent of
/// each other, exhausting one never affects another.
pub struct RateLimiter {
    window: Duration,
    max_requests: usize,
    buckets: Mutex<AHashMap<String, Bucket>>,
}

impl RateLimiter {
    pub fn new(window: Duration, max_requests: usize) -> Self {
        Self {
            window,
            max_requests,
            buckets: Mutex::new(AHashMap::new()),
        }
    }

    /// Admit or reject one request for the key.
    ///
    /// # Example
    ///
    /// ```
    /// use std::time::Duration;
    ///
    /// use signaling_server::limiter::RateLimiter;
    ///
    /// let limiter = RateLimiter::new(Duration::from_secs(60), 2);
    ///
    /// assert!(limiter.allow("1.2.3.4"));
    /// assert!(limiter.allow("1.2.3.4"));
    /// assert!(!limiter.allow("1.2.3.4"));
    ///
    /// // Another key keeps its own budget.
    /// assert!(limiter.allow("5.6.7.8"));
    /// ```
    pub fn allow(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut buckets = self.buckets.lock();

        let bucket = buckets.entry(key.to_string()).or_insert(Bucket {
            count: 0,
            reset_at: now + self.window,
        });

        // An expired bucket is reset lazily instead of by a timer.
        if now > bucket.reset_at {
            bucket.count = 0;
            bucket.reset_at = now + self.window;
        }

        if bucket.count >= self.max_requests {
            return false;
        }

        bucket.count += 1;
        true
    }

    /// How many requests the key may still make in the current window.
    ///
    /// # Example
    ///
    /// ```
    /// use std::time::Duration;
    ///
    /// use signaling_server::limiter::RateLimiter;
    ///
    /// let limiter = RateLimiter::new(Duration::from_secs(60), 3);
    ///
    /// assert_eq!(limiter.remaining("key"), 3);
    ///
    /// limiter.allow("key");
    /// assert_eq!(limiter.remaining("key"), 2);
    ///
    /// limiter.allow("key");
    /// limiter.allow("key");
    /// assert_eq!(limiter.remaining("key"), 0);
    /// ```
    pub fn remaining(&self, key: &str) -> usize {
        let now = Instant::now();

        match self.buckets.lock().get(key) {
            Some(bucket) if now <= bucket.reset_at => {
                self.max_requests.saturating_sub(bucket.count)
            }
            _ => self.max_requests,
        }
    }

    /// Drop buckets whose window has passed.
    ///
    /// The scavenger task calls this periodically so that one-shot keys do
    /// not accumulate forever. It takes the same lock as `allow`.
    pub fn cleanup(&self) {
        let now = Instant::now();

        self.buckets.lock().retain(|_, bucket| bucket.reset_at >= now);
    }

    /// Number of live buckets, expired ones included until the next sweep.
    pub fn tracked_keys(&self) -> usize {
        self.buckets.lock().len()
    }
}
