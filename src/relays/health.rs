//! Per-relay health: latency EMA, failure counting, backoff, scoring.

use std::sync::Mutex;
use std::time::Duration;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::types::Timestamp;

/// EMA smoothing factor for response time, in milliseconds.
const EMA_ALPHA: f64 = 0.3;

/// Backoff schedule by consecutive failure count, capped at the last step.
const BACKOFF_SCHEDULE: [Duration; 4] = [
    Duration::from_secs(30),
    Duration::from_secs(60),
    Duration::from_secs(120),
    Duration::from_secs(300),
];

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RelayHealth {
    /// EMA of response time in milliseconds.
    pub avg_response_ms: f64,
    pub response_count: u64,
    pub consecutive_failures: u32,
    /// Unix seconds until which the relay is not dialed.
    pub backoff_until: Timestamp,
    pub last_activity: Timestamp,
}

impl RelayHealth {
    pub fn record_success(&mut self, response_ms: f64) {
        self.avg_response_ms = if self.response_count == 0 {
            response_ms
        } else {
            EMA_ALPHA * response_ms + (1.0 - EMA_ALPHA) * self.avg_response_ms
        };
        self.response_count += 1;
        self.consecutive_failures = 0;
        self.backoff_until = 0;
        self.last_activity = crate::utils::now();
    }

    pub fn record_failure(&mut self) {
        self.consecutive_failures += 1;
        let step = (self.consecutive_failures as usize - 1).min(BACKOFF_SCHEDULE.len() - 1);
        self.backoff_until = crate::utils::now() + BACKOFF_SCHEDULE[step].as_secs() as Timestamp;
        self.last_activity = crate::utils::now();
    }

    pub fn in_backoff(&self) -> bool {
        self.backoff_until > crate::utils::now()
    }

    /// Score in [0, 100]: latency tier plus a response-volume bonus, minus
    /// failure and active-backoff penalties.
    pub fn score(&self) -> i32 {
        let latency_tier = if self.response_count == 0 {
            10
        } else if self.avg_response_ms < 200.0 {
            50
        } else if self.avg_response_ms < 500.0 {
            40
        } else if self.avg_response_ms < 1000.0 {
            25
        } else {
            10
        };
        let volume_bonus = self.response_count.min(10) as i32;
        let failure_penalty = (10 * self.consecutive_failures as i32).min(30);
        let backoff_penalty = if self.in_backoff() { 20 } else { 0 };
        (latency_tier + volume_bonus - failure_penalty - backoff_penalty).clamp(0, 100)
    }
}

/// Process-wide health table, keyed by normalized relay URL.
#[derive(Default)]
pub struct HealthRegistry {
    relays: Mutex<FxHashMap<String, RelayHealth>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, url: &str, response_ms: f64) {
        let mut relays = self.relays.lock().expect("health mutex");
        relays.entry(url.to_string()).or_default().record_success(response_ms);
    }

    pub fn record_failure(&self, url: &str) {
        let mut relays = self.relays.lock().expect("health mutex");
        relays.entry(url.to_string()).or_default().record_failure();
    }

    pub fn in_backoff(&self, url: &str) -> bool {
        self.relays
            .lock()
            .expect("health mutex")
            .get(url)
            .is_some_and(RelayHealth::in_backoff)
    }

    pub fn get(&self, url: &str) -> Option<RelayHealth> {
        self.relays.lock().expect("health mutex").get(url).cloned()
    }

    pub fn snapshot(&self) -> Vec<(String, RelayHealth)> {
        self.relays
            .lock()
            .expect("health mutex")
            .iter()
            .map(|(url, health)| (url.clone(), health.clone()))
            .collect()
    }

    /// Stable sort, best score first: ties preserve input order.
    pub fn sort_relays_by_score(&self, urls: &[String]) -> Vec<String> {
        let relays = self.relays.lock().expect("health mutex");
        let mut scored: Vec<(String, i32)> = urls
            .iter()
            .map(|url| {
                let score = relays.get(url).map_or(
                    // Unknown relays rank as a fresh, un-penalized entry.
                    RelayHealth::default().score(),
                    RelayHealth::score,
                );
                (url.clone(), score)
            })
            .collect();
        scored.sort_by(|a, b| b.1.cmp(&a.1));
        scored.into_iter().map(|(url, _)| url).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ema_starts_at_first_sample_then_smooths() {
        let mut health = RelayHealth::default();
        health.record_success(100.0);
        assert_eq!(health.avg_response_ms, 100.0);
        health.record_success(200.0);
        // 0.3 * 200 + 0.7 * 100
        assert!((health.avg_response_ms - 130.0).abs() < 1e-9);
    }

    #[test]
    fn success_clears_failures_and_backoff() {
        let mut health = RelayHealth::default();
        health.record_failure();
        assert!(health.in_backoff());
        assert_eq!(health.consecutive_failures, 1);
        health.record_success(50.0);
        assert!(!health.in_backoff());
        assert_eq!(health.consecutive_failures, 0);
    }

    #[test]
    fn backoff_schedule_escalates_and_caps() {
        let mut health = RelayHealth::default();
        let expectations = [30, 60, 120, 300, 300];
        for expected in expectations {
            let before = crate::utils::now();
            health.record_failure();
            let delta = health.backoff_until - before;
            assert!((expected..=expected + 1).contains(&delta), "delta {delta}");
        }
    }

    #[test]
    fn score_combines_tiers_bonus_and_penalties() {
        let mut fast = RelayHealth::default();
        for _ in 0..12 {
            fast.record_success(100.0);
        }
        // 50 latency tier + 10 capped volume bonus
        assert_eq!(fast.score(), 60);

        let mut slow = RelayHealth::default();
        slow.record_success(1500.0);
        assert_eq!(slow.score(), 11);

        let mut failing = RelayHealth::default();
        for _ in 0..5 {
            failing.record_failure();
        }
        // 10 base − 30 capped failures − 20 backoff, clamped at 0
        assert_eq!(failing.score(), 0);
    }

    #[test]
    fn sort_is_stable_and_descending() {
        let registry = HealthRegistry::new();
        registry.record_success("wss://fast", 100.0);
        registry.record_failure("wss://bad");
        let urls = vec![
            "wss://tied-a".to_string(),
            "wss://bad".to_string(),
            "wss://tied-b".to_string(),
            "wss://fast".to_string(),
        ];
        let sorted = registry.sort_relays_by_score(&urls);
        assert_eq!(sorted[0], "wss://fast");
        // Tied unknown relays keep their input order.
        assert_eq!(sorted[1], "wss://tied-a");
        assert_eq!(sorted[2], "wss://tied-b");
        assert_eq!(sorted[3], "wss://bad");
    }
}
