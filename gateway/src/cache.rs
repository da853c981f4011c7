use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheClass {
    Instruments,
    Curves,
    Products,
    Pricing,
    Historical,
    ServedLatestPrice,
    ServedCurveSnapshot,
    ServedCustomProjection,
}

impl CacheClass {
    pub fn all() -> [CacheClass; 8] {
        [
            Self::Instruments,
            Self::Curves,
            Self::Products,
            Self::Pricing,
            Self::Historical,
            Self::ServedLatestPrice,
            Self::ServedCurveSnapshot,
            Self::ServedCustomProjection,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Instruments => "instruments",
            Self::Curves => "curves",
            Self::Products => "products",
            Self::Pricing => "pricing",
            Self::Historical => "historical",
            Self::ServedLatestPrice => "served_latest_price",
            Self::ServedCurveSnapshot => "served_curve_snapshot",
            Self::ServedCustomProjection => "served_custom_projection",
        }
    }

    pub fn default_ttl(&self) -> Duration {
        let seconds = match self {
            Self::Instruments | Self::Curves => 300,
            Self::Products => 600,
            Self::Pricing => 120,
            Self::Historical => 900,
            Self::ServedLatestPrice => 30,
            Self::ServedCurveSnapshot => 60,
            Self::ServedCustomProjection => 120,
        };
        Duration::from_secs(seconds)
    }

    /// The hot-warm bucket this class belongs to in the warming catalog.
    pub fn warm_category(&self) -> &'static str {
        match self {
            Self::Instruments | Self::Curves | Self::Products => "reference",
            Self::Pricing | Self::Historical => "timeseries",
            Self::ServedLatestPrice | Self::ServedCurveSnapshot | Self::ServedCustomProjection => {
                "served"
            }
        }
    }

    /// Classes whose payloads differ per subject incorporate the subject id
    /// into the cache key.
    pub fn user_scoped(&self) -> bool {
        matches!(self, Self::Instruments | Self::Curves | Self::Products)
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::all().into_iter().find(|class| class.name() == name)
    }
}

#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>>;
    async fn set(&self, key: &str, value: &Value, ttl: Duration) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
}

// ---------------- Redis implementation ----------------

#[derive(Clone)]
pub struct RedisCacheStore {
    manager: ConnectionManager,
    prefix: String,
}

impl RedisCacheStore {
    pub async fn connect(redis_url: &str, prefix: impl Into<String>) -> Result<Self> {
        let client = redis::Client::open(redis_url).context("Failed to create Redis client")?;
        let manager = ConnectionManager::new(client)
            .await
            .context("Failed to create Redis connection manager")?;
        Ok(Self {
            manager,
            prefix: prefix.into(),
        })
    }

    fn redis_key(&self, key: &str) -> String {
        format!("{}:{}", self.prefix, key)
    }
}

#[async_trait]
impl CacheStore for RedisCacheStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let mut conn = self.manager.clone();
        let raw: Option<String> = conn.get(self.redis_key(key)).await?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &Value, ttl: Duration) -> Result<()> {
        let mut conn = self.manager.clone();
        let raw = serde_json::to_string(value)?;
        let _: () = conn
            .set_ex(self.redis_key(key), raw, ttl.as_secs().max(1))
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: () = conn.del(self.redis_key(key)).await?;
        Ok(())
    }
}

// ---------------- In-memory implementation ----------------

#[derive(Default)]
pub struct MemoryCacheStore {
    entries: RwLock<HashMap<String, (Value, Instant)>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some((value, expires_at)) if *expires_at > Instant::now() => {
                    return Ok(Some(value.clone()))
                }
                Some(_) => {}
                None => return Ok(None),
            }
        }
        // Entry exists but lapsed; drop it.
        self.entries.write().await.remove(key);
        Ok(None)
    }

    async fn set(&self, key: &str, value: &Value, ttl: Duration) -> Result<()> {
        let mut entries = self.entries.write().await;
        entries.insert(key.to_string(), (value.clone(), Instant::now() + ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}

// ---------------- Manager ----------------

#[derive(Default)]
struct ClassCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheClassStats {
    pub class: &'static str,
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub hit_ratio: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheCatalogEntry {
    pub class: &'static str,
    pub default_ttl_seconds: u64,
    pub warm_category: &'static str,
    pub user_scoped: bool,
}

/// Class-scoped response cache. Keys are `{class}:{tenant}:{logical key}`,
/// with the subject id prepended to the logical key for user-scoped classes.
pub struct CacheManager {
    store: Box<dyn CacheStore>,
    ttls: HashMap<CacheClass, Duration>,
    counters: HashMap<CacheClass, ClassCounters>,
}

impl CacheManager {
    pub fn new(store: Box<dyn CacheStore>, ttl_overrides: &HashMap<String, u64>) -> Self {
        let mut ttls = HashMap::new();
        let mut counters = HashMap::new();
        for class in CacheClass::all() {
            let ttl = ttl_overrides
                .get(class.name())
                .map(|secs| Duration::from_secs(*secs))
                .unwrap_or_else(|| class.default_ttl());
            ttls.insert(class, ttl);
            counters.insert(class, ClassCounters::default());
        }
        Self {
            store,
            ttls,
            counters,
        }
    }

    pub fn ttl_for(&self, class: CacheClass) -> Duration {
        self.ttls[&class]
    }

    pub fn cache_key(class: CacheClass, tenant_id: &str, user_id: &str, logical: &str) -> String {
        if class.user_scoped() {
            format!("{}:{}:{}:{}", class.name(), tenant_id, user_id, logical)
        } else {
            format!("{}:{}:{}", class.name(), tenant_id, logical)
        }
    }

    pub async fn get(
        &self,
        class: CacheClass,
        tenant_id: &str,
        user_id: &str,
        logical: &str,
    ) -> Option<Value> {
        let key = Self::cache_key(class, tenant_id, user_id, logical);
        match self.store.get(&key).await {
            Ok(Some(value)) => {
                self.counters[&class].hits.fetch_add(1, Ordering::Relaxed);
                Some(value)
            }
            Ok(None) => {
                self.counters[&class].misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            Err(err) => {
                // A cache outage must read as a miss, not a failure.
                warn!(error = %err, key, "cache read failed");
                self.counters[&class].misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub async fn set(
        &self,
        class: CacheClass,
        tenant_id: &str,
        user_id: &str,
        logical: &str,
        value: &Value,
    ) {
        let key = Self::cache_key(class, tenant_id, user_id, logical);
        match self.store.set(&key, value, self.ttl_for(class)).await {
            Ok(()) => {
                self.counters[&class].sets.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => warn!(error = %err, key, "cache write failed"),
        }
    }

    pub async fn invalidate(&self, class: CacheClass, tenant_id: &str, user_id: &str, logical: &str) {
        let key = Self::cache_key(class, tenant_id, user_id, logical);
        if let Err(err) = self.store.delete(&key).await {
            warn!(error = %err, key, "cache invalidation failed");
        }
    }

    pub fn stats(&self) -> Vec<CacheClassStats> {
        CacheClass::all()
            .into_iter()
            .map(|class| {
                let counters = &self.counters[&class];
                let hits = counters.hits.load(Ordering::Relaxed);
                let misses = counters.misses.load(Ordering::Relaxed);
                let total = hits + misses;
                CacheClassStats {
                    class: class.name(),
                    hits,
                    misses,
                    sets: counters.sets.load(Ordering::Relaxed),
                    hit_ratio: if total == 0 {
                        0.0
                    } else {
                        hits as f64 / total as f64
                    },
                }
            })
            .collect()
    }

    pub fn catalog(&self) -> Vec<CacheCatalogEntry> {
        CacheClass::all()
            .into_iter()
            .map(|class| CacheCatalogEntry {
                class: class.name(),
                default_ttl_seconds: self.ttl_for(class).as_secs(),
                warm_category: class.warm_category(),
                user_scoped: class.user_scoped(),
            })
            .collect()
    }
}
