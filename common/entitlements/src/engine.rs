use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::cache::DecisionCache;
use crate::error::{EntitlementError, EntitlementResult};
use crate::model::{
    CheckRequest, ConditionOperator, Decision, Rule, RuleCondition, RuleDraft, WILDCARD,
};
use crate::store::RuleStore;

const DEFAULT_DECISION_TTL: Duration = Duration::from_secs(60);

/// Prioritised allow/deny evaluation over the rule store, with a short-lived
/// decision cache invalidated by rule mutations.
pub struct EntitlementEngine {
    store: Arc<dyn RuleStore>,
    cache: DecisionCache,
    tenant_versions: RwLock<HashMap<String, u64>>,
    global_epoch: AtomicU64,
}

impl EntitlementEngine {
    pub fn new(store: Arc<dyn RuleStore>) -> Self {
        Self::with_ttl(store, DEFAULT_DECISION_TTL)
    }

    pub fn with_ttl(store: Arc<dyn RuleStore>, decision_ttl: Duration) -> Self {
        Self {
            store,
            cache: DecisionCache::new(decision_ttl),
            tenant_versions: RwLock::new(HashMap::new()),
            global_epoch: AtomicU64::new(0),
        }
    }

    pub fn store(&self) -> &Arc<dyn RuleStore> {
        &self.store
    }

    async fn version_for(&self, tenant_id: &str) -> u64 {
        let epoch = self.global_epoch.load(Ordering::SeqCst);
        let versions = self.tenant_versions.read().await;
        let tenant = versions.get(tenant_id).copied().unwrap_or(0);
        (epoch << 32) ^ tenant
    }

    async fn bump_version(&self, tenant_scope: Option<&str>) {
        match tenant_scope {
            None | Some(WILDCARD) => {
                // Wildcard rules affect every tenant's decisions.
                self.global_epoch.fetch_add(1, Ordering::SeqCst);
                self.cache.clear().await;
            }
            Some(tenant) => {
                let mut versions = self.tenant_versions.write().await;
                *versions.entry(tenant.to_string()).or_insert(0) += 1;
            }
        }
    }

    pub async fn check(&self, request: &CheckRequest) -> EntitlementResult<Decision> {
        let version = self.version_for(&request.tenant_id).await;
        let cache_key = DecisionCache::key(request, version);
        if let Some(decision) = self.cache.get(&cache_key).await {
            return Ok(decision);
        }

        let now = Utc::now();
        let candidates = self
            .store
            .load_candidates(&request.tenant_id, &request.resource)
            .await?;
        let candidates: Vec<Rule> = candidates
            .into_iter()
            .filter(|rule| !rule.is_expired(now) && rule.matches_user(&request.user_id))
            .collect();

        let decision = evaluate(&candidates, request);
        debug!(
            user_id = %request.user_id,
            tenant_id = %request.tenant_id,
            resource = %request.resource,
            action = %request.action,
            allowed = decision.allowed,
            evaluated = decision.evaluated_count,
            "entitlement check"
        );

        if cacheable(&candidates, now, self.cache.ttl()) {
            self.cache.put(cache_key, decision.clone()).await;
        }
        Ok(decision)
    }

    pub async fn create_rule(&self, draft: RuleDraft) -> EntitlementResult<Rule> {
        validate_draft(&draft)?;
        let now = Utc::now();
        let rule = Rule {
            rule_id: Uuid::new_v4().to_string(),
            name: draft.name,
            description: draft.description,
            resource: draft.resource,
            effect: draft.effect,
            conditions: draft.conditions,
            priority: draft.priority,
            enabled: draft.enabled,
            tenant_id: draft.tenant_id,
            user_id: draft.user_id,
            created_at: now,
            updated_at: now,
            expires_at: draft.expires_at,
        };
        self.store.save(rule.clone()).await?;
        self.bump_version(rule.tenant_id.as_deref()).await;
        Ok(rule)
    }

    pub async fn get_rule(&self, rule_id: &str) -> EntitlementResult<Rule> {
        self.store
            .load(rule_id)
            .await?
            .ok_or_else(|| EntitlementError::RuleNotFound(rule_id.to_string()))
    }

    pub async fn list_rules(&self, tenant_id: Option<&str>) -> EntitlementResult<Vec<Rule>> {
        match tenant_id {
            Some(tenant) => self.store.load_for_tenant(tenant).await,
            None => self.store.load_all().await,
        }
    }

    pub async fn update_rule(&self, rule_id: &str, draft: RuleDraft) -> EntitlementResult<Rule> {
        validate_draft(&draft)?;
        let existing = self.get_rule(rule_id).await?;
        let previous_scope = existing.tenant_id.clone();
        let rule = Rule {
            rule_id: existing.rule_id,
            name: draft.name,
            description: draft.description,
            resource: draft.resource,
            effect: draft.effect,
            conditions: draft.conditions,
            priority: draft.priority,
            enabled: draft.enabled,
            tenant_id: draft.tenant_id,
            user_id: draft.user_id,
            created_at: existing.created_at,
            updated_at: Utc::now(),
            expires_at: draft.expires_at,
        };
        self.store.save(rule.clone()).await?;
        // Both the old and the new scope observed a change.
        self.bump_version(previous_scope.as_deref()).await;
        if previous_scope != rule.tenant_id {
            self.bump_version(rule.tenant_id.as_deref()).await;
        }
        Ok(rule)
    }

    pub async fn delete_rule(&self, rule_id: &str) -> EntitlementResult<()> {
        let existing = self.get_rule(rule_id).await?;
        if !self.store.delete(rule_id).await? {
            return Err(EntitlementError::RuleNotFound(rule_id.to_string()));
        }
        self.bump_version(existing.tenant_id.as_deref()).await;
        Ok(())
    }

    pub async fn cached_decisions(&self) -> usize {
        self.cache.len().await
    }
}

fn validate_draft(draft: &RuleDraft) -> EntitlementResult<()> {
    if draft.name.trim().is_empty() {
        return Err(EntitlementError::InvalidRule("rule name is required".into()));
    }
    if draft.resource.trim().is_empty() {
        return Err(EntitlementError::InvalidRule(
            "rule resource is required".into(),
        ));
    }
    Ok(())
}

/// A decision is safe to cache only when no candidate rule's expiry falls
/// inside the cache TTL; such rules would flip the outcome mid-entry.
fn cacheable(candidates: &[Rule], now: DateTime<Utc>, ttl: Duration) -> bool {
    let horizon = now + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(60));
    candidates
        .iter()
        .all(|rule| rule.expires_at.map(|at| at > horizon).unwrap_or(true))
}

fn evaluate(candidates: &[Rule], request: &CheckRequest) -> Decision {
    let mut ordered: Vec<&Rule> = candidates.iter().collect();
    ordered.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then(a.created_at.cmp(&b.created_at))
            .then(a.rule_id.cmp(&b.rule_id))
    });

    let document = evaluation_document(request);
    for rule in &ordered {
        if rule
            .conditions
            .iter()
            .all(|condition| condition_matches(condition, &document))
        {
            return Decision {
                allowed: matches!(rule.effect, crate::model::Effect::Allow),
                reason: format!("matched rule '{}'", rule.name),
                matched_rule_ids: vec![rule.rule_id.clone()],
                evaluated_count: ordered.len(),
            };
        }
    }
    Decision::default_deny(ordered.len())
}

/// The attribute tree conditions resolve against. Context keys surface at the
/// top level; reserved attributes win on collision.
fn evaluation_document(request: &CheckRequest) -> Value {
    let mut document = serde_json::Map::new();
    for (key, value) in &request.context {
        document.insert(key.clone(), value.clone());
    }
    document.insert(
        "subject".to_string(),
        json!({"id": request.user_id, "tenant": request.tenant_id}),
    );
    document.insert("user_id".to_string(), json!(request.user_id));
    document.insert("tenant".to_string(), json!(request.tenant_id));
    document.insert("tenant_id".to_string(), json!(request.tenant_id));
    document.insert("resource".to_string(), json!(request.resource));
    document.insert("action".to_string(), json!(request.action));
    document.insert(
        "context".to_string(),
        Value::Object(request.context.clone().into_iter().collect()),
    );
    Value::Object(document)
}

fn resolve_path<'a>(document: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = document;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

/// Expand `{{path}}` references in rule values before comparison. A value
/// that is exactly one template resolves to the referenced attribute with its
/// original type.
fn expand_templates(value: &Value, document: &Value) -> Value {
    let Value::String(text) = value else {
        return value.clone();
    };
    let trimmed = text.trim();
    if trimmed.starts_with("{{") && trimmed.ends_with("}}") && !trimmed[2..].contains("{{") {
        let path = trimmed[2..trimmed.len() - 2].trim();
        return resolve_path(document, path).cloned().unwrap_or(Value::Null);
    }

    let mut rendered = text.clone();
    while let (Some(start), Some(end)) = (rendered.find("{{"), rendered.find("}}")) {
        if end <= start {
            break;
        }
        let path = rendered[start + 2..end].trim().to_string();
        let replacement = match resolve_path(document, &path) {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        };
        rendered.replace_range(start..end + 2, &replacement);
    }
    Value::String(rendered)
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left.as_f64(), right.as_f64()) {
        (Some(a), Some(b)) => a == b,
        _ => left == right,
    }
}

fn condition_matches(condition: &RuleCondition, document: &Value) -> bool {
    let Some(target) = resolve_path(document, &condition.field) else {
        // Missing attributes never satisfy a condition.
        return false;
    };
    let expected = expand_templates(&condition.value, document);

    match condition.operator {
        ConditionOperator::Equals => values_equal(target, &expected),
        ConditionOperator::NotEquals => !values_equal(target, &expected),
        ConditionOperator::In => expected
            .as_array()
            .map(|items| items.iter().any(|item| values_equal(target, item)))
            .unwrap_or(false),
        ConditionOperator::NotIn => expected
            .as_array()
            .map(|items| !items.iter().any(|item| values_equal(target, item)))
            .unwrap_or(false),
        ConditionOperator::Contains => match target {
            Value::String(haystack) => expected
                .as_str()
                .map(|needle| haystack.contains(needle))
                .unwrap_or(false),
            Value::Array(items) => items.iter().any(|item| values_equal(item, &expected)),
            _ => false,
        },
        ConditionOperator::StartsWith => match (target.as_str(), expected.as_str()) {
            (Some(haystack), Some(prefix)) => haystack.starts_with(prefix),
            _ => false,
        },
        ConditionOperator::EndsWith => match (target.as_str(), expected.as_str()) {
            (Some(haystack), Some(suffix)) => haystack.ends_with(suffix),
            _ => false,
        },
        ConditionOperator::GreaterThan => match (target.as_f64(), expected.as_f64()) {
            (Some(a), Some(b)) => a > b,
            _ => false,
        },
        ConditionOperator::LessThan => match (target.as_f64(), expected.as_f64()) {
            (Some(a), Some(b)) => a < b,
            _ => false,
        },
        ConditionOperator::Between => {
            let Some(value) = target.as_f64() else {
                return false;
            };
            let bounds = match &expected {
                Value::Object(map) => (
                    map.get("min").and_then(Value::as_f64),
                    map.get("max").and_then(Value::as_f64),
                ),
                Value::Array(items) if items.len() == 2 => {
                    (items[0].as_f64(), items[1].as_f64())
                }
                _ => (None, None),
            };
            match bounds {
                (Some(min), Some(max)) => value >= min && value <= max,
                _ => false,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Effect;
    use crate::store::MemoryRuleStore;

    fn engine() -> EntitlementEngine {
        EntitlementEngine::new(Arc::new(MemoryRuleStore::new()))
    }

    fn draft(name: &str, effect: Effect, priority: i32) -> RuleDraft {
        RuleDraft {
            name: name.to_string(),
            description: None,
            resource: "instrument".to_string(),
            effect,
            conditions: Vec::new(),
            priority,
            enabled: true,
            tenant_id: Some("t1".to_string()),
            user_id: None,
            expires_at: None,
        }
    }

    fn condition(field: &str, operator: ConditionOperator, value: Value) -> RuleCondition {
        RuleCondition {
            field: field.to_string(),
            operator,
            value,
            description: None,
        }
    }

    #[tokio::test]
    async fn empty_rule_set_denies_by_default() {
        let engine = engine();
        let decision = engine
            .check(&CheckRequest::new("u1", "t1", "instrument", "read"))
            .await
            .unwrap();
        assert!(!decision.allowed);
        assert!(decision.matched_rule_ids.is_empty());
        assert_eq!(decision.evaluated_count, 0);
    }

    #[tokio::test]
    async fn higher_priority_rule_wins() {
        let engine = engine();
        let mut allow = draft("allow users", Effect::Allow, 100);
        allow.conditions = vec![condition(
            "roles",
            ConditionOperator::Contains,
            json!("user"),
        )];
        engine.create_rule(allow).await.unwrap();

        let mut deny = draft("deny restricted", Effect::Deny, 200);
        deny.conditions = vec![condition(
            "resource_id",
            ConditionOperator::Equals,
            json!("RESTRICTED"),
        )];
        let deny = engine.create_rule(deny).await.unwrap();

        let request = CheckRequest::new("u1", "t1", "instrument", "read")
            .with_roles(&["user".to_string()])
            .with_context("resource_id", json!("RESTRICTED"));
        let decision = engine.check(&request).await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.matched_rule_ids, vec![deny.rule_id]);
        assert_eq!(decision.evaluated_count, 2);
    }

    #[tokio::test]
    async fn equal_priority_breaks_ties_by_creation_time() {
        let engine = engine();
        let first = engine.create_rule(draft("first", Effect::Deny, 50)).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        engine.create_rule(draft("second", Effect::Allow, 50)).await.unwrap();

        let decision = engine
            .check(&CheckRequest::new("u1", "t1", "instrument", "read"))
            .await
            .unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.matched_rule_ids, vec![first.rule_id]);
    }

    #[tokio::test]
    async fn disabled_and_expired_rules_do_not_participate() {
        let engine = engine();
        let mut disabled = draft("disabled allow", Effect::Allow, 10);
        disabled.enabled = false;
        engine.create_rule(disabled).await.unwrap();

        let mut expired = draft("expired allow", Effect::Allow, 10);
        expired.expires_at = Some(Utc::now() - chrono::Duration::minutes(1));
        engine.create_rule(expired).await.unwrap();

        let decision = engine
            .check(&CheckRequest::new("u1", "t1", "instrument", "read"))
            .await
            .unwrap();
        assert!(!decision.allowed);
        assert!(decision.matched_rule_ids.is_empty());
    }

    #[tokio::test]
    async fn template_condition_compares_against_context() {
        let engine = engine();
        let mut rule = draft("own-tenant only", Effect::Allow, 10);
        rule.conditions = vec![condition(
            "tenant",
            ConditionOperator::Equals,
            json!("{{subject.tenant}}"),
        )];
        engine.create_rule(rule).await.unwrap();

        let decision = engine
            .check(&CheckRequest::new("u1", "t1", "instrument", "read"))
            .await
            .unwrap();
        assert!(decision.allowed);
    }

    #[tokio::test]
    async fn mutation_invalidates_cached_decisions() {
        let engine = engine();
        let request = CheckRequest::new("u1", "t1", "instrument", "read");

        let before = engine.check(&request).await.unwrap();
        assert!(!before.allowed);

        engine.create_rule(draft("allow all", Effect::Allow, 10)).await.unwrap();
        let after = engine.check(&request).await.unwrap();
        assert!(after.allowed, "stale deny served after rule mutation");
    }

    #[tokio::test]
    async fn wildcard_tenant_mutation_invalidates_every_tenant() {
        let engine = engine();
        let request = CheckRequest::new("u1", "t2", "instrument", "read");
        assert!(!engine.check(&request).await.unwrap().allowed);

        let mut global = draft("global allow", Effect::Allow, 10);
        global.tenant_id = None;
        engine.create_rule(global).await.unwrap();
        assert!(engine.check(&request).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn tenant_scoped_rule_does_not_leak_across_tenants() {
        let engine = engine();
        engine.create_rule(draft("t1 allow", Effect::Allow, 10)).await.unwrap();

        let other = CheckRequest::new("u1", "t2", "instrument", "read");
        assert!(!engine.check(&other).await.unwrap().allowed);
    }

    #[test]
    fn operator_matrix() {
        let document = json!({
            "name": "brent-crude",
            "price": 52.5,
            "roles": ["user", "analyst"],
            "region": "EU",
        });
        let cases = vec![
            (condition("name", ConditionOperator::Equals, json!("brent-crude")), true),
            (condition("name", ConditionOperator::NotEquals, json!("wti")), true),
            (condition("region", ConditionOperator::In, json!(["EU", "US"])), true),
            (condition("region", ConditionOperator::NotIn, json!(["US"])), true),
            (condition("name", ConditionOperator::Contains, json!("crude")), true),
            (condition("roles", ConditionOperator::Contains, json!("analyst")), true),
            (condition("name", ConditionOperator::StartsWith, json!("brent")), true),
            (condition("name", ConditionOperator::EndsWith, json!("crude")), true),
            (condition("price", ConditionOperator::GreaterThan, json!(50)), true),
            (condition("price", ConditionOperator::LessThan, json!(53)), true),
            (condition("price", ConditionOperator::Between, json!({"min": 50, "max": 55})), true),
            (condition("price", ConditionOperator::Between, json!([53, 55])), false),
            (condition("missing", ConditionOperator::Equals, json!("x")), false),
        ];
        for (cond, expected) in cases {
            assert_eq!(
                condition_matches(&cond, &document),
                expected,
                "condition {:?} on {:?}",
                cond.operator,
                cond.field
            );
        }
    }
}
