//! Core rate limiter implementation.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

use super::rate::RateSpec;
use crate::cache::{AgingCache, Update};

/// Outcome of one admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    allowed: bool,
    retry_after: Duration,
}

impl Decision {
    /// Admit the request.
    pub fn allow() -> Self {
        Self {
            allowed: true,
            retry_after: Duration::ZERO,
        }
    }

    /// Reject the request; the caller may retry after `retry_after`.
    pub fn deny(retry_after: Duration) -> Self {
        Self {
            allowed: false,
            retry_after,
        }
    }

    /// Whether the request may proceed.
    pub fn is_allowed(&self) -> bool {
        self.allowed
    }

    /// Time until the caller's window resets. Zero for admitted requests.
    pub fn retry_after(&self) -> Duration {
        self.retry_after
    }

    /// [`Decision::retry_after`] in fractional seconds.
    pub fn retry_after_secs(&self) -> f64 {
        self.retry_after.as_secs_f64()
    }
}

/// Fixed-window request counter keyed by caller.
///
/// Each key moves through `unseen -> counting -> full -> unseen`: the first
/// hit opens a window of `spec.window()` with a count of one, later hits in
/// that window bump the count until it reaches `spec.limit()`, after which
/// every hit is denied without being counted. The count resets only when
/// the window expires.
///
/// This struct is thread-safe and can be shared across multiple tasks.
pub struct RateLimiter {
    /// Per-key counters
    cache: Arc<AgingCache<u64>>,
    /// Rate applied by [`RateLimiter::check`]
    spec: RateSpec,
}

impl RateLimiter {
    /// Create a rate limiter with its own cache.
    pub fn new(spec: RateSpec) -> Self {
        Self::with_cache(Arc::new(AgingCache::new()), spec)
    }

    /// Create a rate limiter over an existing cache.
    ///
    /// The cache should not be shared with another limiter, or the two
    /// will count against each other's keys.
    pub fn with_cache(cache: Arc<AgingCache<u64>>, spec: RateSpec) -> Self {
        Self { cache, spec }
    }

    /// The configured rate.
    pub fn spec(&self) -> &RateSpec {
        &self.spec
    }

    /// The counter cache.
    pub fn cache(&self) -> &Arc<AgingCache<u64>> {
        &self.cache
    }

    /// Check `key` against the configured rate.
    pub fn check(&self, key: &str) -> Decision {
        self.decide(key, &self.spec)
    }

    /// Count a hit for `key` under `spec` and decide whether it may proceed.
    ///
    /// An empty key is always admitted and never counted. A zero limit
    /// denies every other key for a full window.
    pub fn decide(&self, key: &str, spec: &RateSpec) -> Decision {
        if key.is_empty() {
            trace!("Empty key, bypassing rate limit");
            return Decision::allow();
        }

        let limit = spec.limit();
        if limit == 0 {
            return Decision::deny(spec.window());
        }

        let touch = self.cache.atomic_update(key, 1, spec.window(), |count| {
            if *count < limit {
                Update::Replace(count + 1)
            } else {
                Update::Keep
            }
        });

        trace!(
            key = %key,
            previous = touch.previous,
            inserted = touch.inserted,
            "Checking rate limit"
        );

        if touch.inserted || touch.previous < limit {
            return Decision::allow();
        }

        debug!(
            key = %key,
            limit = limit,
            retry_after_ms = touch.remaining.as_millis() as u64,
            "Rate limit exceeded"
        );
        Decision::deny(touch.remaining)
    }

    /// Get the current count for a key.
    ///
    /// Returns `None` if the key has no live window.
    pub fn counter_value(&self, key: &str) -> Option<u64> {
        self.cache.load(key)
    }

    /// Clear all counters.
    pub fn clear(&self) {
        self.cache.clear();
    }

    /// Get the number of stored counters.
    pub fn counter_count(&self) -> usize {
        self.cache.len()
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("spec", &self.spec.to_string())
            .field("counters", &self.cache.len())
            .finish()
    }
}
