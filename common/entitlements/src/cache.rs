use std::collections::HashMap;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

use crate::model::{CheckRequest, Decision};

/// Short-lived cache of entitlement decisions. Keys fold in the tenant's
/// rule-set version, so any mutation implicitly invalidates prior entries.
pub struct DecisionCache {
    ttl: Duration,
    entries: RwLock<HashMap<String, CachedDecision>>,
}

struct CachedDecision {
    decision: Decision,
    stored_at: Instant,
}

impl DecisionCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn key(request: &CheckRequest, version: u64) -> String {
        let mut hasher = Sha256::new();
        hasher.update(request.user_id.as_bytes());
        hasher.update([0]);
        hasher.update(request.tenant_id.as_bytes());
        hasher.update([0]);
        hasher.update(request.resource.as_bytes());
        hasher.update([0]);
        hasher.update(request.action.as_bytes());
        hasher.update([0]);
        // BTreeMap iteration is ordered, so equal contexts hash equally.
        for (key, value) in &request.context {
            hasher.update(key.as_bytes());
            hasher.update([1]);
            hasher.update(value.to_string().as_bytes());
            hasher.update([1]);
        }
        hasher.update(version.to_be_bytes());
        hex::encode(hasher.finalize())
    }

    pub async fn get(&self, key: &str) -> Option<Decision> {
        let entries = self.entries.read().await;
        let entry = entries.get(key)?;
        if entry.stored_at.elapsed() >= self.ttl {
            return None;
        }
        Some(entry.decision.clone())
    }

    pub async fn put(&self, key: String, decision: Decision) {
        let mut entries = self.entries.write().await;
        // Opportunistic sweep keeps the map from accumulating dead entries.
        if entries.len() > 10_000 {
            let ttl = self.ttl;
            entries.retain(|_, entry| entry.stored_at.elapsed() < ttl);
        }
        entries.insert(
            key,
            CachedDecision {
                decision,
                stored_at: Instant::now(),
            },
        );
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_is_stable_and_version_sensitive() {
        let request = CheckRequest::new("u1", "t1", "instrument", "read")
            .with_context("resource_id", json!("BRN"));
        let again = CheckRequest::new("u1", "t1", "instrument", "read")
            .with_context("resource_id", json!("BRN"));
        assert_eq!(DecisionCache::key(&request, 1), DecisionCache::key(&again, 1));
        assert_ne!(DecisionCache::key(&request, 1), DecisionCache::key(&request, 2));
    }

    #[test]
    fn key_varies_with_context() {
        let a = CheckRequest::new("u1", "t1", "instrument", "read")
            .with_context("resource_id", json!("BRN"));
        let b = CheckRequest::new("u1", "t1", "instrument", "read")
            .with_context("resource_id", json!("WTI"));
        assert_ne!(DecisionCache::key(&a, 1), DecisionCache::key(&b, 1));
    }

    #[tokio::test]
    async fn entries_expire_after_ttl() {
        let cache = DecisionCache::new(Duration::from_millis(20));
        cache
            .put("k".into(), Decision::default_deny(0))
            .await;
        assert!(cache.get("k").await.is_some());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(cache.get("k").await.is_none());
    }
}
