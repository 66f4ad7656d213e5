use crate::cache::Freshness;
use crate::rate_limiter::{RateLimitAction, RateLimitRule};
use crate::retry::{Backoff, RetryPolicy};
use serde::Deserialize;
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

// Per-query cache and retry settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct QueryPolicy {
    pub stale_time_ms: u64,
    pub expire_time_ms: u64,
    #[serde(flatten)]
    pub retry: RetryPolicy,
}

impl Default for QueryPolicy {
    fn default() -> Self {
        Self {
            stale_time_ms: 30_000,
            expire_time_ms: 300_000,
            retry: RetryPolicy::default(),
        }
    }
}

impl QueryPolicy {
    pub fn freshness(&self) -> Freshness {
        Freshness::new(
            Duration::from_millis(self.stale_time_ms),
            Duration::from_millis(self.expire_time_ms),
        )
    }

    pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time_ms = stale_time.as_millis() as u64;
        self
    }
}

// Change-feed reconnect budget before a channel reports degraded mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    #[serde(flatten)]
    pub backoff: Backoff,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: Backoff {
                base_ms: 500,
                cap_ms: 10_000,
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_file: String,
    pub bind_addr: String,
    pub rate_limits: HashMap<RateLimitAction, RateLimitRule>,
    pub query: QueryPolicy,
    pub reconnect: ReconnectPolicy,
    pub purge_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_file: ":memory:".to_string(),
            bind_addr: "0.0.0.0:5000".to_string(),
            rate_limits: RateLimitRule::defaults(),
            query: QueryPolicy::default(),
            reconnect: ReconnectPolicy::default(),
            purge_interval: Duration::from_secs(30 * 60),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    // Unparseable values are reported and replaced by defaults; loading never fails.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Config::default();

        if let Some(file) = lookup("DATABASE_FILE") {
            config.database_file = file;
        }
        if let Some(addr) = lookup("BIND_ADDR") {
            config.bind_addr = addr;
        }

        if let Some(raw) = lookup("RATE_LIMITS") {
            match serde_json::from_str::<HashMap<RateLimitAction, RateLimitRule>>(&raw) {
                Ok(overrides) => config.rate_limits.extend(overrides),
                Err(e) => warn!("Ignoring RATE_LIMITS: {}", e),
            }
        }

        let q = &mut config.query;
        parse_into(&lookup, "QUERY_STALE_TIME_MS", &mut q.stale_time_ms);
        parse_into(&lookup, "QUERY_EXPIRE_TIME_MS", &mut q.expire_time_ms);
        parse_into(&lookup, "QUERY_RETRY_COUNT", &mut q.retry.retry_count);
        parse_into(&lookup, "QUERY_RETRY_BACKOFF_BASE_MS", &mut q.retry.backoff.base_ms);
        parse_into(&lookup, "QUERY_RETRY_BACKOFF_CAP_MS", &mut q.retry.backoff.cap_ms);
        if q.stale_time_ms > q.expire_time_ms {
            warn!(
                "QUERY_STALE_TIME_MS {} exceeds QUERY_EXPIRE_TIME_MS {}, clamping",
                q.stale_time_ms, q.expire_time_ms
            );
            q.stale_time_ms = q.expire_time_ms;
        }

        let r = &mut config.reconnect;
        parse_into(&lookup, "REALTIME_RECONNECT_ATTEMPTS", &mut r.max_attempts);
        parse_into(&lookup, "REALTIME_RECONNECT_BASE_MS", &mut r.backoff.base_ms);
        parse_into(&lookup, "REALTIME_RECONNECT_CAP_MS", &mut r.backoff.cap_ms);

        let mut purge_secs = config.purge_interval.as_secs();
        parse_into(&lookup, "PURGE_INTERVAL_SECS", &mut purge_secs);
        config.purge_interval = Duration::from_secs(purge_secs.max(1));

        config
    }

    pub fn rate_limit(&self, action: RateLimitAction) -> RateLimitRule {
        self.rate_limits
            .get(&action)
            .copied()
            .unwrap_or_else(|| action.default_rule())
    }
}

fn parse_into<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str, slot: &mut T)
where
    T::Err: std::fmt::Display,
{
    let Some(raw) = lookup(name) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(value) => *slot = value,
        Err(e) => warn!("Ignoring {}={:?}: {}", name, raw, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_match_the_documented_table() {
        let config = Config::from_lookup(env(&[]));
        assert_eq!(config.database_file, ":memory:");
        let sign_in = config.rate_limit(RateLimitAction::SignIn);
        assert_eq!(sign_in.max_attempts, 5);
        assert_eq!(sign_in.window_ms, 15 * 60 * 1000);
        assert_eq!(config.rate_limit(RateLimitAction::FileUpload).max_attempts, 10);
        assert_eq!(config.query.retry.retry_count, 3);
    }

    #[test]
    fn rate_limit_overrides_merge_over_defaults() {
        let config = Config::from_lookup(env(&[(
            "RATE_LIMITS",
            r#"{"sign-in": {"max_attempts": 2, "window_ms": 1000}}"#,
        )]));
        assert_eq!(config.rate_limit(RateLimitAction::SignIn).max_attempts, 2);
        assert_eq!(config.rate_limit(RateLimitAction::SignUp).max_attempts, 3);
    }

    #[test]
    fn bad_values_fall_back_to_defaults() {
        let config = Config::from_lookup(env(&[
            ("QUERY_RETRY_COUNT", "many"),
            ("RATE_LIMITS", "{not json"),
            ("QUERY_STALE_TIME_MS", "900000"),
            ("QUERY_EXPIRE_TIME_MS", "60000"),
        ]));
        assert_eq!(config.query.retry.retry_count, 3);
        assert_eq!(config.query.stale_time_ms, 60_000);
        assert_eq!(config.rate_limits.len(), 4);
    }
}
