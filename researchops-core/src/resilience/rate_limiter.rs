//! Fixed-window request admission per client and endpoint.
//!
//! Every `(identifier, endpoint)` pair owns an independent counting window.
//! Up to `limit` requests per window are admitted normally; a burst allowance
//! admits a few more (reporting zero remaining) before requests are rejected.
//! Rejected requests do not advance the counter, so it saturates at the
//! burst ceiling until the window rolls over.

use crate::config::{EndpointLimit, RateLimitConfig};
use crate::error::RateLimitError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Window key used when a check names no endpoint.
pub const DEFAULT_ENDPOINT: &str = "*";

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Requests left before the nominal limit is reached.
    pub remaining: u32,
    /// Nominal limit of the window that was checked.
    pub limit: u32,
    /// Time until the current window ends.
    pub reset_after: Duration,
    /// Wall-clock end of the current window.
    pub reset_at: DateTime<Utc>,
}

#[derive(Debug)]
struct Window {
    count: u32,
    window_start: Instant,
    limit: u32,
    length: Duration,
    ceiling: u32,
}

/// Per-client, per-endpoint fixed-window rate limiter.
#[derive(Debug)]
pub struct RateLimiter {
    default: EndpointLimit,
    endpoints: HashMap<String, EndpointLimit>,
    burst_multiplier: f64,
    burst_allowance: Option<u32>,
    windows: Mutex<HashMap<(String, String), Window>>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            default: EndpointLimit {
                limit: config.default_limit,
                window_secs: config.default_window_secs,
            },
            endpoints: config.endpoints.clone(),
            burst_multiplier: config.burst_multiplier,
            burst_allowance: config.burst_allowance,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Limits that apply to `endpoint`, falling back to the default.
    pub fn limits_for(&self, endpoint: Option<&str>) -> EndpointLimit {
        endpoint
            .and_then(|ep| self.endpoints.get(ep))
            .copied()
            .unwrap_or(self.default)
    }

    /// Number of requests admitted per window for a given nominal limit.
    pub fn burst_ceiling(&self, limit: u32) -> u32 {
        let ceiling = match self.burst_allowance {
            Some(extra) => limit.saturating_add(extra),
            None => {
                let scaled = (f64::from(limit) * self.burst_multiplier).floor();
                if scaled >= f64::from(u32::MAX) {
                    u32::MAX
                } else {
                    scaled as u32
                }
            }
        };
        ceiling.max(limit)
    }

    /// Check and count one request from `identifier` against `endpoint`.
    pub fn check(&self, identifier: &str, endpoint: Option<&str>) -> RateLimitDecision {
        let limits = self.limits_for(endpoint);
        let ceiling = self.burst_ceiling(limits.limit);
        let key = (
            identifier.to_string(),
            endpoint.unwrap_or(DEFAULT_ENDPOINT).to_string(),
        );
        let now = Instant::now();

        let mut windows = self.lock();
        let window = windows.entry(key).or_insert_with(|| Window {
            count: 0,
            window_start: now,
            limit: limits.limit,
            length: Duration::from_secs(limits.window_secs),
            ceiling,
        });

        let mut elapsed = now.saturating_duration_since(window.window_start);
        if elapsed >= window.length {
            window.count = 0;
            window.window_start = now;
            elapsed = Duration::ZERO;
        }
        let reset_after = window.length.saturating_sub(elapsed);

        let (allowed, remaining) = if window.count < window.limit {
            let remaining = window.limit - window.count - 1;
            window.count += 1;
            (true, remaining)
        } else if window.count < window.ceiling {
            window.count += 1;
            (true, 0)
        } else {
            (false, 0)
        };

        if !allowed {
            debug!(
                identifier,
                endpoint = endpoint.unwrap_or(DEFAULT_ENDPOINT),
                limit = window.limit,
                reset_secs = reset_after.as_secs(),
                "Rate limit exceeded"
            );
        }

        let until_reset =
            chrono::Duration::from_std(reset_after).unwrap_or_else(|_| chrono::Duration::zero());
        RateLimitDecision {
            allowed,
            remaining,
            limit: window.limit,
            reset_after,
            reset_at: Utc::now() + until_reset,
        }
    }

    /// Like [`check`](Self::check), but converts a rejection into a typed error.
    pub fn check_or_reject(
        &self,
        identifier: &str,
        endpoint: Option<&str>,
    ) -> Result<RateLimitDecision, RateLimitError> {
        let decision = self.check(identifier, endpoint);
        if decision.allowed {
            Ok(decision)
        } else {
            Err(RateLimitError {
                identifier: identifier.to_string(),
                endpoint: endpoint.unwrap_or(DEFAULT_ENDPOINT).to_string(),
                limit: decision.limit,
                reset_after: decision.reset_after,
            })
        }
    }

    /// Drop windows whose period has ended. Returns how many were removed.
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let mut windows = self.lock();
        let before = windows.len();
        windows.retain(|_, w| now.saturating_duration_since(w.window_start) < w.length);
        before - windows.len()
    }

    /// Number of live windows.
    pub fn window_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<(String, String), Window>> {
        self.windows.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(limit: u32, window_secs: u64) -> RateLimiter {
        RateLimiter::new(&RateLimitConfig {
            default_limit: limit,
            default_window_secs: window_secs,
            burst_multiplier: 1.0,
            burst_allowance: None,
            endpoints: HashMap::new(),
        })
    }

    #[test]
    fn test_remaining_counts_down_then_rejects() {
        let limiter = limiter(5, 10);
        let remaining: Vec<u32> = (0..5)
            .map(|_| {
                let d = limiter.check("client-a", None);
                assert!(d.allowed);
                d.remaining
            })
            .collect();
        assert_eq!(remaining, vec![4, 3, 2, 1, 0]);

        let sixth = limiter.check("client-a", None);
        assert!(!sixth.allowed);
        assert_eq!(sixth.remaining, 0);
        assert!(sixth.reset_after <= Duration::from_secs(10));
    }

    #[test]
    fn test_identifiers_are_independent() {
        let limiter = limiter(5, 10);
        for _ in 0..6 {
            limiter.check("client-a", None);
        }
        let other = limiter.check("client-b", None);
        assert!(other.allowed);
        assert_eq!(other.remaining, 4);
    }

    #[test]
    fn test_endpoint_overrides() {
        let mut config = RateLimitConfig::default();
        config.endpoints.insert(
            "/research".into(),
            EndpointLimit {
                limit: 10,
                window_secs: 60,
            },
        );
        config.endpoints.insert(
            "/health".into(),
            EndpointLimit {
                limit: 100,
                window_secs: 60,
            },
        );
        let limiter = RateLimiter::new(&config);

        let research = limiter.check("client-a", Some("/research"));
        assert_eq!(research.limit, 10);
        assert_eq!(research.remaining, 9);

        let health = limiter.check("client-a", Some("/health"));
        assert_eq!(health.limit, 100);
        assert_eq!(health.remaining, 99);

        let research = limiter.check("client-a", Some("/research"));
        assert_eq!(research.remaining, 8);

        let unmatched = limiter.check("client-a", Some("/unknown"));
        assert_eq!(unmatched.limit, config.default_limit);
    }

    #[test]
    fn test_explicit_burst_allowance_boundary() {
        let limiter = RateLimiter::new(&RateLimitConfig {
            default_limit: 5,
            default_window_secs: 10,
            burst_multiplier: 1.5,
            burst_allowance: Some(1),
            endpoints: HashMap::new(),
        });
        for _ in 0..5 {
            assert!(limiter.check("c", None).allowed);
        }
        let burst = limiter.check("c", None);
        assert!(burst.allowed);
        assert_eq!(burst.remaining, 0);
        assert!(!limiter.check("c", None).allowed);
    }

    #[test]
    fn test_burst_ceiling_from_multiplier_floors() {
        let limiter = RateLimiter::new(&RateLimitConfig {
            burst_multiplier: 1.5,
            ..RateLimitConfig::default()
        });
        assert_eq!(limiter.burst_ceiling(5), 7);
        assert_eq!(limiter.burst_ceiling(10), 15);
        assert_eq!(limiter.burst_ceiling(1), 1);
    }

    #[test]
    fn test_rejections_do_not_advance_counter() {
        let limiter = limiter(2, 60);
        for _ in 0..2 {
            limiter.check("c", None);
        }
        for _ in 0..100 {
            assert!(!limiter.check("c", None).allowed);
        }
        let windows = limiter.lock();
        let window = &windows[&("c".to_string(), DEFAULT_ENDPOINT.to_string())];
        assert_eq!(window.count, 2);
    }

    #[test]
    fn test_check_or_reject() {
        let limiter = limiter(1, 30);
        assert!(limiter.check_or_reject("c", Some("/research")).is_ok());
        let err = limiter.check_or_reject("c", Some("/research")).unwrap_err();
        assert_eq!(err.limit, 1);
        assert_eq!(err.endpoint, "/research");
        assert!(err.reset_after <= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_resets_after_period() {
        let limiter = limiter(5, 10);
        for _ in 0..5 {
            limiter.check("c", None);
        }
        assert!(!limiter.check("c", None).allowed);

        tokio::time::advance(Duration::from_secs(9)).await;
        let still_blocked = limiter.check("c", None);
        assert!(!still_blocked.allowed);
        assert_eq!(still_blocked.reset_after, Duration::from_secs(1));

        tokio::time::advance(Duration::from_secs(1)).await;
        let fresh = limiter.check("c", None);
        assert!(fresh.allowed);
        assert_eq!(fresh.remaining, 4);
        assert_eq!(fresh.reset_after, Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_expired() {
        let limiter = limiter(5, 10);
        limiter.check("a", None);
        limiter.check("b", Some("/x"));
        assert_eq!(limiter.window_count(), 2);
        assert_eq!(limiter.cleanup_expired(), 0);

        tokio::time::advance(Duration::from_secs(10)).await;
        limiter.check("c", None);
        assert_eq!(limiter.cleanup_expired(), 2);
        assert_eq!(limiter.window_count(), 1);
    }
}
