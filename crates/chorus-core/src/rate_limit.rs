use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chorus_models::gateway::codes;
use chorus_store::SharedStore;
use chrono::{DateTime, TimeZone, Utc};

use crate::keys;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateAction {
    Message,
    Connection,
    Upload,
}

impl RateAction {
    pub fn as_str(self) -> &'static str {
        match self {
            RateAction::Message => "message",
            RateAction::Connection => "connection",
            RateAction::Upload => "upload",
        }
    }

    pub fn error_code(self) -> &'static str {
        match self {
            RateAction::Message => codes::MESSAGE_RATE_LIMIT,
            RateAction::Connection => codes::CONNECTION_RATE_LIMIT,
            RateAction::Upload => codes::UPLOAD_RATE_LIMIT,
        }
    }
}

impl fmt::Display for RateAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Budget {
    pub limit: u32,
    pub window: Duration,
}

impl Budget {
    pub const fn per_minute(limit: u32) -> Self {
        Self {
            limit,
            window: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateBudgets {
    pub message: Budget,
    pub connection: Budget,
    pub upload: Budget,
}

impl RateBudgets {
    pub fn for_action(&self, action: RateAction) -> Budget {
        match action {
            RateAction::Message => self.message,
            RateAction::Connection => self.connection,
            RateAction::Upload => self.upload,
        }
    }
}

impl Default for RateBudgets {
    fn default() -> Self {
        Self {
            message: Budget::per_minute(10),
            connection: Budget::per_minute(5),
            upload: Budget::per_minute(3),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub count: u64,
    pub limit: u32,
    pub reset_time: DateTime<Utc>,
}

impl RateDecision {
    pub fn retry_after(&self, now: DateTime<Utc>) -> Duration {
        (self.reset_time - now).to_std().unwrap_or_default()
    }
}

/// Fixed-window counters in the shared store, one key per
/// (action, subject, window bucket). Fails open when the store is down.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn SharedStore>,
    budgets: RateBudgets,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn SharedStore>, budgets: RateBudgets) -> Self {
        Self { store, budgets }
    }

    pub fn budgets(&self) -> &RateBudgets {
        &self.budgets
    }

    /// Count one attempt of `action` by `subject` against its configured budget.
    pub async fn check(&self, subject: &str, action: RateAction) -> RateDecision {
        let budget = self.budgets.for_action(action);
        self.check_rate(subject, action.as_str(), budget.limit, budget.window)
            .await
    }

    pub async fn check_rate(
        &self,
        subject: &str,
        action: &str,
        limit: u32,
        window: Duration,
    ) -> RateDecision {
        self.check_rate_at(subject, action, limit, window, Utc::now())
            .await
    }

    pub async fn check_rate_at(
        &self,
        subject: &str,
        action: &str,
        limit: u32,
        window: Duration,
        now: DateTime<Utc>,
    ) -> RateDecision {
        let window_ms = (window.as_millis() as i64).max(1);
        let bucket = now.timestamp_millis().div_euclid(window_ms);
        let reset_time = Utc
            .timestamp_millis_opt((bucket + 1) * window_ms)
            .single()
            .unwrap_or(now);
        let key = keys::rate(action, subject, bucket);

        match self.store.incr(&key, 1, Some(window)).await {
            Ok(count) => {
                let count = count.max(0) as u64;
                let allowed = count <= limit as u64;
                if !allowed {
                    tracing::debug!(subject, action, count, limit, "rate limit exceeded");
                }
                RateDecision {
                    allowed,
                    count,
                    limit,
                    reset_time,
                }
            }
            Err(err) => {
                tracing::warn!(subject, action, error = %err, "rate limiter store failure, allowing");
                RateDecision {
                    allowed: true,
                    count: 0,
                    limit,
                    reset_time,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chorus_store::MemoryStore;

    fn limiter(store: Arc<MemoryStore>) -> RateLimiter {
        RateLimiter::new(store, RateBudgets::default())
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_750_000_020 + secs, 0).single().unwrap()
    }

    #[tokio::test]
    async fn fourth_upload_in_window_is_rejected() {
        let limiter = limiter(Arc::new(MemoryStore::new()));
        let window = Duration::from_secs(60);
        let mut results = Vec::new();
        for i in 0..4 {
            let decision = limiter.check_rate_at("u1", "upload", 3, window, at(i)).await;
            results.push(decision.allowed);
        }
        assert_eq!(results, vec![true, true, true, false]);

        let next = limiter.check_rate_at("u1", "upload", 3, window, at(61)).await;
        assert!(next.allowed);
        assert_eq!(next.count, 1);
    }

    #[tokio::test]
    async fn reports_count_and_reset_time() {
        let limiter = limiter(Arc::new(MemoryStore::new()));
        let window = Duration::from_secs(60);
        let decision = limiter.check_rate_at("u1", "message", 10, window, at(5)).await;
        assert_eq!(decision.count, 1);
        assert_eq!(decision.limit, 10);
        assert_eq!(decision.reset_time.timestamp() % 60, 0);
        assert!(decision.reset_time > at(5));
        assert!(decision.retry_after(at(5)) <= window);
    }

    #[tokio::test]
    async fn subjects_and_actions_are_independent() {
        let limiter = limiter(Arc::new(MemoryStore::new()));
        let window = Duration::from_secs(60);
        assert!(limiter.check_rate_at("u1", "upload", 1, window, at(0)).await.allowed);
        assert!(!limiter.check_rate_at("u1", "upload", 1, window, at(1)).await.allowed);
        assert!(limiter.check_rate_at("u2", "upload", 1, window, at(1)).await.allowed);
        assert!(limiter.check_rate_at("u1", "message", 1, window, at(1)).await.allowed);
    }

    #[tokio::test]
    async fn store_outage_fails_open() {
        let store = Arc::new(MemoryStore::new());
        let limiter = limiter(Arc::clone(&store));
        store.set_offline(true);
        for _ in 0..20 {
            assert!(limiter.check("u1", RateAction::Message).await.allowed);
        }
    }
}
