use crate::clock::Clock;
use crate::error::StoreError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePool;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

// Security-sensitive actions gated independently of the UI that triggers them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RateLimitAction {
    SignIn,
    SignUp,
    PasswordReset,
    FileUpload,
}

impl RateLimitAction {
    pub const ALL: [RateLimitAction; 4] = [
        RateLimitAction::SignIn,
        RateLimitAction::SignUp,
        RateLimitAction::PasswordReset,
        RateLimitAction::FileUpload,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RateLimitAction::SignIn => "sign-in",
            RateLimitAction::SignUp => "sign-up",
            RateLimitAction::PasswordReset => "password-reset",
            RateLimitAction::FileUpload => "file-upload",
        }
    }

    pub fn default_rule(self) -> RateLimitRule {
        const MINUTE: i64 = 60 * 1000;
        match self {
            RateLimitAction::SignIn => RateLimitRule::new(5, 15 * MINUTE),
            RateLimitAction::SignUp => RateLimitRule::new(3, 60 * MINUTE),
            RateLimitAction::PasswordReset => RateLimitRule::new(3, 60 * MINUTE),
            RateLimitAction::FileUpload => RateLimitRule::new(10, MINUTE),
        }
    }
}

impl fmt::Display for RateLimitAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RateLimitAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| format!("unknown rate-limited action '{s}'"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRule {
    pub max_attempts: u32,
    pub window_ms: i64,
}

impl RateLimitRule {
    pub const fn new(max_attempts: u32, window_ms: i64) -> Self {
        Self {
            max_attempts,
            window_ms,
        }
    }

    pub fn defaults() -> HashMap<RateLimitAction, RateLimitRule> {
        RateLimitAction::ALL
            .into_iter()
            .map(|a| (a, a.default_rule()))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitResult {
    pub allowed: bool,
    pub remaining_attempts: u32,
    // Epoch milliseconds at which the oldest counted attempt leaves the window.
    pub reset_time: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

// Attempts for one (action, identifier) inside the window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowStats {
    pub count: u32,
    pub oldest_ms: Option<i64>,
}

/// Where attempt rows live. Only attempts with `since_ms <= at <= until_ms` count.
#[async_trait]
pub trait AttemptStore: Send + Sync {
    async fn window(
        &self,
        action: RateLimitAction,
        identifier: &str,
        since_ms: i64,
        until_ms: i64,
    ) -> Result<WindowStats, StoreError>;

    async fn append(
        &self,
        action: RateLimitAction,
        identifier: &str,
        success: bool,
        at_ms: i64,
    ) -> Result<(), StoreError>;

    // Physically removes attempts older than `cutoff_ms`. Returns the removed count.
    async fn purge_before(&self, cutoff_ms: i64) -> Result<u64, StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryAttemptStore {
    attempts: Mutex<HashMap<(RateLimitAction, String), Vec<i64>>>,
}

impl MemoryAttemptStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AttemptStore for MemoryAttemptStore {
    async fn window(
        &self,
        action: RateLimitAction,
        identifier: &str,
        since_ms: i64,
        until_ms: i64,
    ) -> Result<WindowStats, StoreError> {
        let attempts = self
            .attempts
            .lock()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let mut stats = WindowStats::default();
        if let Some(times) = attempts.get(&(action, identifier.to_string())) {
            for &at in times.iter().filter(|&&at| at >= since_ms && at <= until_ms) {
                stats.count += 1;
                stats.oldest_ms = Some(stats.oldest_ms.map_or(at, |o| o.min(at)));
            }
        }
        Ok(stats)
    }

    async fn append(
        &self,
        action: RateLimitAction,
        identifier: &str,
        _success: bool,
        at_ms: i64,
    ) -> Result<(), StoreError> {
        self.attempts
            .lock()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?
            .entry((action, identifier.to_string()))
            .or_default()
            .push(at_ms);
        Ok(())
    }

    async fn purge_before(&self, cutoff_ms: i64) -> Result<u64, StoreError> {
        let mut attempts = self
            .attempts
            .lock()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let mut removed = 0u64;
        attempts.retain(|_, times| {
            let before = times.len();
            times.retain(|&at| at >= cutoff_ms);
            removed += (before - times.len()) as u64;
            !times.is_empty()
        });
        Ok(removed)
    }
}

// Attempt rows in the `rate_limit_attempts` table.
#[derive(Debug, Clone)]
pub struct SqliteAttemptStore {
    db: SqlitePool,
}

impl SqliteAttemptStore {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl AttemptStore for SqliteAttemptStore {
    async fn window(
        &self,
        action: RateLimitAction,
        identifier: &str,
        since_ms: i64,
        until_ms: i64,
    ) -> Result<WindowStats, StoreError> {
        let (count, oldest) = sqlx::query_as::<_, (i64, Option<i64>)>(
            "SELECT COUNT(*), MIN(attempted_at) FROM rate_limit_attempts
             WHERE action = ? AND identifier = ? AND attempted_at >= ? AND attempted_at <= ?",
        )
        .bind(action.as_str())
        .bind(identifier)
        .bind(since_ms)
        .bind(until_ms)
        .fetch_one(&self.db)
        .await?;
        Ok(WindowStats {
            count: count as u32,
            oldest_ms: oldest,
        })
    }

    async fn append(
        &self,
        action: RateLimitAction,
        identifier: &str,
        success: bool,
        at_ms: i64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO rate_limit_attempts (action, identifier, success, attempted_at) VALUES (?, ?, ?, ?)",
        )
        .bind(action.as_str())
        .bind(identifier)
        .bind(success)
        .bind(at_ms)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn purge_before(&self, cutoff_ms: i64) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM rate_limit_attempts WHERE attempted_at < ?")
            .bind(cutoff_ms)
            .execute(&self.db)
            .await?;
        Ok(result.rows_affected())
    }
}

/// Sliding-window limiter. Fails open: when the attempt store errors, the action
/// is allowed and the condition is logged.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn AttemptStore>,
    rules: HashMap<RateLimitAction, RateLimitRule>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(
        store: Arc<dyn AttemptStore>,
        rules: HashMap<RateLimitAction, RateLimitRule>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            rules,
            clock,
        }
    }

    pub fn rule(&self, action: RateLimitAction) -> RateLimitRule {
        self.rules
            .get(&action)
            .copied()
            .unwrap_or_else(|| action.default_rule())
    }

    // Longest configured window; attempts older than this can never count again.
    pub fn longest_window_ms(&self) -> i64 {
        RateLimitAction::ALL
            .into_iter()
            .map(|a| self.rule(a).window_ms)
            .max()
            .unwrap_or_default()
    }

    pub fn store(&self) -> &Arc<dyn AttemptStore> {
        &self.store
    }

    pub async fn check(&self, action: RateLimitAction, identifier: &str) -> RateLimitResult {
        let rule = self.rule(action);
        let now = self.clock.now_ms();

        let stats = match self
            .store
            .window(action, identifier, now - rule.window_ms, now)
            .await
        {
            Ok(stats) => stats,
            Err(e) => {
                warn!(%action, identifier, error = %e, "rate-limit store failed, allowing attempt");
                return RateLimitResult {
                    allowed: true,
                    remaining_attempts: rule.max_attempts,
                    reset_time: now + rule.window_ms,
                    message: None,
                };
            }
        };

        let allowed = stats.count < rule.max_attempts;
        let reset_time = stats.oldest_ms.map_or(now + rule.window_ms, |o| o + rule.window_ms);
        let message = (!allowed).then(|| {
            let minutes = ((reset_time - now).max(0) + 59_999) / 60_000;
            format!(
                "Too many {} attempts. Please try again in {} minute{}.",
                action,
                minutes.max(1),
                if minutes > 1 { "s" } else { "" }
            )
        });
        debug!(%action, identifier, attempts = stats.count, allowed, "rate-limit check");

        RateLimitResult {
            allowed,
            remaining_attempts: rule.max_attempts.saturating_sub(stats.count),
            reset_time,
            message,
        }
    }

    // Successful and failed attempts both consume a slot.
    pub async fn record(&self, action: RateLimitAction, identifier: &str, success: bool) {
        let now = self.clock.now_ms();
        if let Err(e) = self.store.append(action, identifier, success, now).await {
            warn!(%action, identifier, error = %e, "failed to record rate-limit attempt");
        }
    }
}
