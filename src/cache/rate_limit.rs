//! Sliding-window rate limiting with a strict in-process fallback.
//!
//! The primary limiter keeps per-key timestamp windows in the shared cache
//! backend. If the backend fails the limiter never fails open: it falls
//! through to an in-process window with *stricter* limits (3/5 of the
//! requested limit, rounded up) so an attacker cannot widen their budget by
//! taking the cache down.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use super::{CacheError, KvBackend};
use crate::types::Timestamp;

const RATE_LIMIT_PREFIX: &str = "ratelimit:";

/// Upper bound on fallback buckets. At ~40 bytes per timestamp entry this
/// bounds memory near 200 KB and defeats key-flooding.
const FALLBACK_MAX_BUCKETS: usize = 5_000;

/// Outcome of a `check` call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub remaining: u32,
}

pub struct RateLimiter {
    backend: Arc<dyn KvBackend>,
    fallback: Mutex<FallbackLimiter>,
    // Serializes check/increment pairs so concurrent callers observe counts
    // that sum exactly to the number of increments.
    window_lock: Mutex<()>,
}

impl RateLimiter {
    pub fn new(backend: Arc<dyn KvBackend>) -> Self {
        Self {
            backend,
            fallback: Mutex::new(FallbackLimiter::new(FALLBACK_MAX_BUCKETS)),
            window_lock: Mutex::new(()),
        }
    }

    /// The stricter budget applied when the primary backend is down.
    fn fallback_limit(limit: u32) -> u32 {
        ((limit as u64 * 3).div_ceil(5)).max(1) as u32
    }

    pub async fn check(&self, key: &str, limit: u32, window: Duration) -> RateDecision {
        let _guard = self.window_lock.lock().await;
        self.check_inner(key, limit, window).await
    }

    pub async fn increment(&self, key: &str, window: Duration) {
        let _guard = self.window_lock.lock().await;
        self.increment_inner(key, window).await;
    }

    /// Check-then-increment under one hold of the window lock, so two
    /// concurrent callers can never both pass a nearly-full window.
    pub async fn allow(&self, key: &str, limit: u32, window: Duration) -> RateDecision {
        let _guard = self.window_lock.lock().await;
        let decision = self.check_inner(key, limit, window).await;
        if decision.allowed {
            self.increment_inner(key, window).await;
        }
        decision
    }

    /// Callers hold `window_lock`.
    async fn check_inner(&self, key: &str, limit: u32, window: Duration) -> RateDecision {
        match self.load_window(key, window).await {
            Ok(timestamps) => {
                let count = timestamps.len() as u32;
                RateDecision {
                    allowed: count < limit,
                    remaining: limit.saturating_sub(count),
                }
            }
            Err(e) => {
                tracing::debug!(key, error = %e, "rate-limit backend error, using fallback");
                self.fallback
                    .lock()
                    .await
                    .check(key, Self::fallback_limit(limit), window)
            }
        }
    }

    /// Callers hold `window_lock`.
    async fn increment_inner(&self, key: &str, window: Duration) {
        let now = crate::utils::now();
        match self.load_window(key, window).await {
            Ok(mut timestamps) => {
                timestamps.push(now);
                let full_key = format!("{RATE_LIMIT_PREFIX}{key}");
                let bytes = serde_json::to_vec(&timestamps).unwrap_or_default();
                if let Err(e) = self.backend.set(&full_key, bytes, window).await {
                    tracing::debug!(key, error = %e, "rate-limit write failed, recording in fallback");
                    self.fallback.lock().await.increment(key, window);
                }
            }
            Err(_) => self.fallback.lock().await.increment(key, window),
        }
    }

    async fn load_window(
        &self,
        key: &str,
        window: Duration,
    ) -> Result<Vec<Timestamp>, CacheError> {
        let full_key = format!("{RATE_LIMIT_PREFIX}{key}");
        let cutoff = crate::utils::now() - window.as_secs() as Timestamp;
        let timestamps: Vec<Timestamp> = match self.backend.get(&full_key).await? {
            Some(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
            None => Vec::new(),
        };
        Ok(timestamps.into_iter().filter(|&t| t > cutoff).collect())
    }
}

/// In-process sliding windows, bounded. At saturation it evicts expired
/// buckets and, if still full, denies new keys rather than growing.
struct FallbackLimiter {
    max_buckets: usize,
    buckets: HashMap<String, VecDeque<Timestamp>>,
}

impl FallbackLimiter {
    fn new(max_buckets: usize) -> Self {
        Self {
            max_buckets,
            buckets: HashMap::new(),
        }
    }

    fn prune(bucket: &mut VecDeque<Timestamp>, cutoff: Timestamp) {
        while bucket.front().is_some_and(|&t| t <= cutoff) {
            bucket.pop_front();
        }
    }

    fn check(&mut self, key: &str, limit: u32, window: Duration) -> RateDecision {
        let cutoff = crate::utils::now() - window.as_secs() as Timestamp;
        if let Some(bucket) = self.buckets.get_mut(key) {
            Self::prune(bucket, cutoff);
            let count = bucket.len() as u32;
            return RateDecision {
                allowed: count < limit,
                remaining: limit.saturating_sub(count),
            };
        }
        if self.buckets.len() >= self.max_buckets {
            self.evict_expired(cutoff);
            if self.buckets.len() >= self.max_buckets {
                // Saturated: deny rather than grow.
                return RateDecision {
                    allowed: false,
                    remaining: 0,
                };
            }
        }
        RateDecision {
            allowed: limit > 0,
            remaining: limit,
        }
    }

    fn increment(&mut self, key: &str, window: Duration) {
        let cutoff = crate::utils::now() - window.as_secs() as Timestamp;
        if !self.buckets.contains_key(key) {
            if self.buckets.len() >= self.max_buckets {
                self.evict_expired(cutoff);
            }
            if self.buckets.len() >= self.max_buckets {
                return;
            }
        }
        let bucket = self.buckets.entry(key.to_string()).or_default();
        Self::prune(bucket, cutoff);
        bucket.push_back(crate::utils::now());
    }

    fn evict_expired(&mut self, cutoff: Timestamp) {
        self.buckets.retain(|_, bucket| {
            Self::prune(bucket, cutoff);
            !bucket.is_empty()
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryBackend;
    use async_trait::async_trait;

    fn limiter() -> RateLimiter {
        RateLimiter::new(Arc::new(MemoryBackend::new()))
    }

    #[tokio::test]
    async fn allows_up_to_limit_then_denies() {
        let limiter = limiter();
        let window = Duration::from_secs(60);
        for _ in 0..5 {
            assert!(limiter.allow("ip:1", 5, window).await.allowed);
        }
        let decision = limiter.allow("ip:1", 5, window).await;
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let limiter = limiter();
        let window = Duration::from_secs(60);
        for _ in 0..5 {
            assert!(limiter.allow("ip:1", 5, window).await.allowed);
        }
        assert!(limiter.allow("ip:2", 5, window).await.allowed);
    }

    #[tokio::test]
    async fn concurrent_allows_admit_exactly_the_limit() {
        let limiter = Arc::new(limiter());
        let window = Duration::from_secs(60);
        let mut handles = Vec::new();
        for _ in 0..20 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                limiter.allow("contended", 5, window).await.allowed
            }));
        }
        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 5);
        let decision = limiter.check("contended", 5, window).await;
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
    }

    #[tokio::test]
    async fn concurrent_increments_sum_exactly() {
        let limiter = Arc::new(limiter());
        let window = Duration::from_secs(60);
        let mut handles = Vec::new();
        for _ in 0..20 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                limiter.increment("shared", window).await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        let decision = limiter.check("shared", 100, window).await;
        assert_eq!(decision.remaining, 80);
    }

    struct FailingBackend;

    #[async_trait]
    impl KvBackend for FailingBackend {
        async fn get(&self, _: &str) -> Result<Option<Vec<u8>>, CacheError> {
            Err(CacheError::Backend("down".into()))
        }
        async fn set(&self, _: &str, _: Vec<u8>, _: Duration) -> Result<(), CacheError> {
            Err(CacheError::Backend("down".into()))
        }
        async fn delete(&self, _: &str) -> Result<(), CacheError> {
            Err(CacheError::Backend("down".into()))
        }
        async fn get_multiple(&self, _: &[String]) -> Result<Vec<Option<Vec<u8>>>, CacheError> {
            Err(CacheError::Backend("down".into()))
        }
        async fn set_multiple(
            &self,
            _: Vec<(String, Vec<u8>)>,
            _: Duration,
        ) -> Result<(), CacheError> {
            Err(CacheError::Backend("down".into()))
        }
        async fn close(&self) -> Result<(), CacheError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn backend_failure_falls_back_with_stricter_limit() {
        let limiter = RateLimiter::new(Arc::new(FailingBackend));
        let window = Duration::from_secs(60);
        // Requested limit 5 → fallback limit 3, never fail-open.
        for _ in 0..3 {
            assert!(limiter.allow("ip:1", 5, window).await.allowed);
        }
        assert!(!limiter.allow("ip:1", 5, window).await.allowed);
    }

    #[test]
    fn fallback_limit_is_three_fifths_rounded_up() {
        assert_eq!(RateLimiter::fallback_limit(5), 3);
        assert_eq!(RateLimiter::fallback_limit(10), 6);
        assert_eq!(RateLimiter::fallback_limit(1), 1);
    }

    #[test]
    fn saturated_fallback_denies_new_keys() {
        let mut fallback = FallbackLimiter::new(2);
        let window = Duration::from_secs(60);
        fallback.increment("a", window);
        fallback.increment("b", window);
        let decision = fallback.check("c", 5, window);
        assert!(!decision.allowed);
        // Existing keys keep working.
        assert!(fallback.check("a", 5, window).allowed);
    }
}
