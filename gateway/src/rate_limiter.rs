use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

pub const CATEGORY_PUBLIC: &str = "public";
pub const CATEGORY_AUTHENTICATED: &str = "authenticated";
pub const CATEGORY_HEAVY: &str = "heavy";
pub const CATEGORY_ADMIN: &str = "admin";

#[derive(Debug, Clone, Serialize)]
pub struct RateDecision {
    pub allowed: bool,
    pub current_count: u32,
    pub limit: u32,
    pub remaining: u32,
    pub reset_in_seconds: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RateLimitStatus {
    pub current_count: u32,
    pub limit: u32,
    pub remaining: u32,
    pub reset_in_seconds: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct GlobalRateStats {
    pub total_clients: usize,
    pub total_requests: u64,
    pub average_requests_per_client: f64,
}

/// Sliding-window limiter backend. The window holds request timestamps; every
/// access evicts entries older than `now - window` before counting.
#[async_trait]
pub trait RateLimiterEngine: Send + Sync {
    async fn check(&self, key: &str, limit: u32, window_secs: u64) -> Result<RateDecision>;
    async fn status(&self, key: &str, limit: u32, window_secs: u64) -> Result<RateLimitStatus>;
    async fn reset(&self, key: &str) -> Result<()>;
    async fn global_stats(&self) -> Result<GlobalRateStats>;
}

fn now_epoch_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

// ---------------- Redis implementation ----------------

/// Eviction, count, admission and TTL run inside one script so concurrent
/// checkers observe a linearisable sequence.
const CHECK_SCRIPT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])
redis.call('ZREMRANGEBYSCORE', key, 0, now - window)
local count = redis.call('ZCARD', key)
if count >= limit then
    local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
    local reset = window
    if oldest[2] then
        reset = math.ceil(tonumber(oldest[2]) + window - now)
        if reset < 1 then reset = 1 end
    end
    return {0, count, reset}
end
redis.call('ZADD', key, now, ARGV[4])
redis.call('EXPIRE', key, window)
return {1, count + 1, window}
"#;

#[derive(Clone)]
pub struct RedisRateLimiter {
    manager: ConnectionManager,
    prefix: String,
    script: Arc<redis::Script>,
}

impl RedisRateLimiter {
    pub async fn connect(redis_url: &str, prefix: impl Into<String>) -> Result<Self> {
        let client = redis::Client::open(redis_url).context("Failed to create Redis client")?;
        let manager = ConnectionManager::new(client)
            .await
            .context("Failed to create Redis connection manager")?;
        Ok(Self {
            manager,
            prefix: prefix.into(),
            script: Arc::new(redis::Script::new(CHECK_SCRIPT)),
        })
    }

    fn redis_key(&self, key: &str) -> String {
        format!("{}:{}", self.prefix, key)
    }
}

#[async_trait]
impl RateLimiterEngine for RedisRateLimiter {
    async fn check(&self, key: &str, limit: u32, window_secs: u64) -> Result<RateDecision> {
        let mut conn = self.manager.clone();
        let member = format!("{}-{}", now_epoch_secs(), Uuid::new_v4());
        let (allowed, count, reset): (i64, i64, i64) = self
            .script
            .key(self.redis_key(key))
            .arg(now_epoch_secs())
            .arg(window_secs)
            .arg(limit)
            .arg(member)
            .invoke_async(&mut conn)
            .await?;

        let current = count.max(0) as u32;
        Ok(RateDecision {
            allowed: allowed == 1,
            current_count: current,
            limit,
            remaining: limit.saturating_sub(current),
            reset_in_seconds: reset.max(0) as u64,
        })
    }

    async fn status(&self, key: &str, limit: u32, window_secs: u64) -> Result<RateLimitStatus> {
        let mut conn = self.manager.clone();
        let redis_key = self.redis_key(key);
        let cutoff = now_epoch_secs() - window_secs as f64;
        let _: () = conn.zrembyscore(&redis_key, 0f64, cutoff).await?;
        let count: u32 = conn.zcard(&redis_key).await?;
        Ok(RateLimitStatus {
            current_count: count,
            limit,
            remaining: limit.saturating_sub(count),
            reset_in_seconds: window_secs,
        })
    }

    async fn reset(&self, key: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: () = conn.del(self.redis_key(key)).await?;
        info!(key, "rate limit window reset");
        Ok(())
    }

    async fn global_stats(&self) -> Result<GlobalRateStats> {
        let mut conn = self.manager.clone();
        let pattern = format!("{}:*", self.prefix);
        let keys: Vec<String> = conn.keys(pattern).await?;
        let mut total_requests: u64 = 0;
        for key in &keys {
            let count: u64 = conn.zcard(key).await?;
            total_requests += count;
        }
        Ok(GlobalRateStats {
            total_clients: keys.len(),
            total_requests,
            average_requests_per_client: total_requests as f64 / keys.len().max(1) as f64,
        })
    }
}

// ---------------- In-memory implementation ----------------

#[derive(Default)]
pub struct MemoryRateLimiter {
    windows: Mutex<HashMap<String, VecDeque<f64>>>,
}

impl MemoryRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }
}

fn evict(window: &mut VecDeque<f64>, now: f64, window_secs: u64) {
    let cutoff = now - window_secs as f64;
    while window.front().map(|ts| *ts <= cutoff).unwrap_or(false) {
        window.pop_front();
    }
}

#[async_trait]
impl RateLimiterEngine for MemoryRateLimiter {
    async fn check(&self, key: &str, limit: u32, window_secs: u64) -> Result<RateDecision> {
        let mut windows = self.windows.lock().await;
        let window = windows.entry(key.to_string()).or_default();
        let now = now_epoch_secs();
        evict(window, now, window_secs);

        let count = window.len() as u32;
        if count >= limit {
            let reset = window
                .front()
                .map(|oldest| (oldest + window_secs as f64 - now).ceil().max(1.0) as u64)
                .unwrap_or(window_secs);
            return Ok(RateDecision {
                allowed: false,
                current_count: count,
                limit,
                remaining: 0,
                reset_in_seconds: reset,
            });
        }

        window.push_back(now);
        Ok(RateDecision {
            allowed: true,
            current_count: count + 1,
            limit,
            remaining: limit - count - 1,
            reset_in_seconds: window_secs,
        })
    }

    async fn status(&self, key: &str, limit: u32, window_secs: u64) -> Result<RateLimitStatus> {
        let mut windows = self.windows.lock().await;
        let now = now_epoch_secs();
        let count = windows
            .get_mut(key)
            .map(|window| {
                evict(window, now, window_secs);
                window.len() as u32
            })
            .unwrap_or(0);
        Ok(RateLimitStatus {
            current_count: count,
            limit,
            remaining: limit.saturating_sub(count),
            reset_in_seconds: window_secs,
        })
    }

    async fn reset(&self, key: &str) -> Result<()> {
        self.windows.lock().await.remove(key);
        Ok(())
    }

    async fn global_stats(&self) -> Result<GlobalRateStats> {
        let windows = self.windows.lock().await;
        let total_requests: u64 = windows.values().map(|w| w.len() as u64).sum();
        Ok(GlobalRateStats {
            total_clients: windows.len(),
            total_requests,
            average_requests_per_client: total_requests as f64 / windows.len().max(1) as f64,
        })
    }
}

// ---------------- Category table + facade ----------------

/// Maps endpoint paths to rate categories and categories to per-minute limits.
#[derive(Debug, Clone)]
pub struct RateLimitCategories {
    limits: HashMap<String, u32>,
}

impl RateLimitCategories {
    pub fn new(overrides: &HashMap<String, u32>) -> Self {
        let mut limits = HashMap::from([
            (CATEGORY_PUBLIC.to_string(), 100),
            (CATEGORY_AUTHENTICATED.to_string(), 1000),
            (CATEGORY_HEAVY.to_string(), 10),
            (CATEGORY_ADMIN.to_string(), 5),
        ]);
        for (key, value) in overrides {
            limits.insert(key.clone(), *value);
        }
        Self { limits }
    }

    pub fn categorize(path: &str) -> &'static str {
        if path.starts_with("/api/v1/cache/warm") || path.starts_with("/api/v1/admin") {
            CATEGORY_ADMIN
        } else if path.starts_with("/api/v1/bulk") || path.ends_with("/recompute") {
            CATEGORY_HEAVY
        } else if path.starts_with("/api/v1/") {
            CATEGORY_AUTHENTICATED
        } else {
            CATEGORY_PUBLIC
        }
    }

    pub fn limit_for(&self, category: &str) -> u32 {
        self.limits
            .get(category)
            .copied()
            .unwrap_or_else(|| self.limits[CATEGORY_AUTHENTICATED])
    }

    pub fn configured(&self) -> &HashMap<String, u32> {
        &self.limits
    }
}

/// The limiter the pipeline talks to: category resolution, keying, and the
/// fail-open policy around the backend engine.
pub struct RateLimiter {
    engine: Arc<dyn RateLimiterEngine>,
    categories: RateLimitCategories,
    window_secs: u64,
}

impl RateLimiter {
    pub fn new(
        engine: Arc<dyn RateLimiterEngine>,
        categories: RateLimitCategories,
        window_secs: u64,
    ) -> Self {
        Self {
            engine,
            categories,
            window_secs,
        }
    }

    pub fn categories(&self) -> &RateLimitCategories {
        &self.categories
    }

    pub fn window_secs(&self) -> u64 {
        self.window_secs
    }

    fn key(client_id: &str, endpoint: &str) -> String {
        format!("{client_id}:{endpoint}")
    }

    /// The limiter is a best-effort guard: a backend outage admits the
    /// request and is surfaced through logs, never to the caller.
    pub async fn check(&self, client_id: &str, endpoint: &str, category: &str) -> RateDecision {
        let limit = self.categories.limit_for(category);
        match self
            .engine
            .check(&Self::key(client_id, endpoint), limit, self.window_secs)
            .await
        {
            Ok(decision) => decision,
            Err(err) => {
                warn!(error = %err, client_id, endpoint, "rate limiter backend failed, failing open");
                RateDecision {
                    allowed: true,
                    current_count: 0,
                    limit,
                    remaining: limit,
                    reset_in_seconds: self.window_secs,
                }
            }
        }
    }

    pub async fn status(&self, client_id: &str, endpoint: &str, category: &str) -> Result<RateLimitStatus> {
        let limit = self.categories.limit_for(category);
        self.engine
            .status(&Self::key(client_id, endpoint), limit, self.window_secs)
            .await
    }

    pub async fn reset(&self, client_id: &str, endpoint: &str) -> Result<()> {
        self.engine.reset(&Self::key(client_id, endpoint)).await
    }

    pub async fn global_stats(&self) -> Result<GlobalRateStats> {
        self.engine.global_stats().await
    }
}
