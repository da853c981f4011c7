use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::cache::{CacheClass, CacheManager};

/// One entry of the hot-query catalog: a cache class plus the parameters its
/// loader needs to recompute the value.
#[derive(Debug, Clone, Deserialize)]
pub struct HotQuery {
    pub class: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct WarmSummary {
    pub warmed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub duration_ms: u64,
    pub by_category: HashMap<String, usize>,
}

/// Recomputes one hot entry. Returns the logical cache key and the payload.
#[async_trait]
pub trait WarmLoader: Send + Sync {
    async fn load(
        &self,
        class: CacheClass,
        tenant_id: &str,
        user_id: &str,
        params: &Value,
    ) -> Result<(String, Value)>;
}

/// The catalog the warmer iterates. Loaded from a JSON file when configured,
/// otherwise the built-in default covering the reference classes.
pub struct HotQueryCatalog {
    queries: Vec<HotQuery>,
}

impl HotQueryCatalog {
    pub fn load(path: Option<&str>) -> Self {
        match path {
            Some(path) => match std::fs::read_to_string(path) {
                Ok(raw) => match serde_json::from_str::<Vec<HotQuery>>(&raw) {
                    Ok(queries) => {
                        info!(count = queries.len(), path, "loaded hot-query catalog");
                        Self { queries }
                    }
                    Err(err) => {
                        warn!(error = %err, path, "invalid hot-query catalog, using defaults");
                        Self::default()
                    }
                },
                Err(err) => {
                    warn!(error = %err, path, "unreadable hot-query catalog, using defaults");
                    Self::default()
                }
            },
            None => Self::default(),
        }
    }

    pub fn from_queries(queries: Vec<HotQuery>) -> Self {
        Self { queries }
    }

    pub fn queries(&self) -> &[HotQuery] {
        &self.queries
    }

    pub fn categories(&self) -> Vec<&'static str> {
        let mut categories: Vec<&'static str> = self
            .queries
            .iter()
            .filter_map(|query| CacheClass::parse(&query.class))
            .map(|class| class.warm_category())
            .collect();
        categories.sort();
        categories.dedup();
        categories
    }
}

impl Default for HotQueryCatalog {
    fn default() -> Self {
        Self {
            queries: vec![
                HotQuery {
                    class: "instruments".into(),
                    params: Value::Null,
                },
                HotQuery {
                    class: "curves".into(),
                    params: Value::Null,
                },
                HotQuery {
                    class: "products".into(),
                    params: Value::Null,
                },
            ],
        }
    }
}

/// Pre-populates cache entries from the hot-query catalog with bounded
/// parallelism; loader failures are logged and counted, never cached.
pub struct CacheWarmer {
    catalog: HotQueryCatalog,
    loader: Arc<dyn WarmLoader>,
    concurrency: usize,
}

impl CacheWarmer {
    pub fn new(catalog: HotQueryCatalog, loader: Arc<dyn WarmLoader>, concurrency: usize) -> Self {
        Self {
            catalog,
            loader,
            concurrency: concurrency.max(1),
        }
    }

    pub fn catalog(&self) -> &HotQueryCatalog {
        &self.catalog
    }

    pub async fn warm(
        &self,
        cache: &CacheManager,
        user_id: &str,
        tenant_id: &str,
    ) -> WarmSummary {
        let started = Instant::now();
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut handles = Vec::new();

        let mut summary = WarmSummary::default();
        for query in self.catalog.queries() {
            let Some(class) = CacheClass::parse(&query.class) else {
                warn!(class = %query.class, "unknown cache class in hot-query catalog");
                summary.skipped += 1;
                continue;
            };
            let semaphore = semaphore.clone();
            let loader = self.loader.clone();
            let params = query.params.clone();
            let tenant = tenant_id.to_string();
            let user = user_id.to_string();
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
                let result = loader.load(class, &tenant, &user, &params).await;
                (class, result)
            }));
        }

        for handle in handles {
            match handle.await {
                Ok((class, Ok((logical, value)))) => {
                    cache.set(class, tenant_id, user_id, &logical, &value).await;
                    summary.warmed += 1;
                    *summary
                        .by_category
                        .entry(class.warm_category().to_string())
                        .or_insert(0) += 1;
                }
                Ok((class, Err(err))) => {
                    warn!(error = %err, class = class.name(), "hot-query loader failed");
                    summary.failed += 1;
                }
                Err(err) => {
                    warn!(error = %err, "warm task panicked");
                    summary.failed += 1;
                }
            }
        }

        summary.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            warmed = summary.warmed,
            failed = summary.failed,
            skipped = summary.skipped,
            duration_ms = summary.duration_ms,
            tenant_id,
            "cache warm finished"
        );
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCacheStore;
    use serde_json::json;

    struct StubLoader;

    #[async_trait]
    impl WarmLoader for StubLoader {
        async fn load(
            &self,
            class: CacheClass,
            _tenant_id: &str,
            _user_id: &str,
            _params: &Value,
        ) -> Result<(String, Value)> {
            if class == CacheClass::Products {
                anyhow::bail!("downstream down");
            }
            Ok(("all".to_string(), json!([{"id": "X"}])))
        }
    }

    #[tokio::test]
    async fn warms_catalog_and_counts_failures() {
        let cache = CacheManager::new(Box::new(MemoryCacheStore::new()), &HashMap::new());
        let warmer = CacheWarmer::new(HotQueryCatalog::default(), Arc::new(StubLoader), 2);

        let summary = warmer.warm(&cache, "u1", "t1").await;
        assert_eq!(summary.warmed, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.skipped, 0);
        assert!(cache.get(CacheClass::Instruments, "t1", "u1", "all").await.is_some());
        assert!(cache.get(CacheClass::Products, "t1", "u1", "all").await.is_none());
    }

    #[tokio::test]
    async fn unknown_classes_are_skipped() {
        let cache = CacheManager::new(Box::new(MemoryCacheStore::new()), &HashMap::new());
        let catalog = HotQueryCatalog::from_queries(vec![HotQuery {
            class: "mystery".into(),
            params: Value::Null,
        }]);
        let warmer = CacheWarmer::new(catalog, Arc::new(StubLoader), 2);
        let summary = warmer.warm(&cache, "u1", "t1").await;
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.warmed, 0);
    }

    #[test]
    fn catalog_reports_categories() {
        let catalog = HotQueryCatalog::default();
        assert_eq!(catalog.categories(), vec!["reference"]);
    }
}
