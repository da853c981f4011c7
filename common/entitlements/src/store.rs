use std::collections::HashMap;

use async_trait::async_trait;
use serde::Serialize;
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use tokio::sync::RwLock;
use tracing::info;

use crate::error::{EntitlementError, EntitlementResult};
use crate::model::{Rule, WILDCARD};

#[derive(Debug, Clone, Default, Serialize)]
pub struct RuleStoreStats {
    pub total_rules: i64,
    pub enabled_rules: i64,
    pub tenant_scoped_rules: i64,
    pub user_scoped_rules: i64,
    pub unique_resources: i64,
    pub unique_tenants: i64,
}

/// Persistence boundary for entitlement rules. Candidate ordering is the
/// evaluation order: priority descending, creation ascending.
#[async_trait]
pub trait RuleStore: Send + Sync {
    async fn save(&self, rule: Rule) -> EntitlementResult<()>;
    async fn load(&self, rule_id: &str) -> EntitlementResult<Option<Rule>>;
    async fn load_all(&self) -> EntitlementResult<Vec<Rule>>;
    /// Enabled rules whose tenant scope covers `tenant_id` and whose resource
    /// equals `resource` or the wildcard.
    async fn load_candidates(&self, tenant_id: &str, resource: &str)
        -> EntitlementResult<Vec<Rule>>;
    async fn load_for_tenant(&self, tenant_id: &str) -> EntitlementResult<Vec<Rule>>;
    async fn delete(&self, rule_id: &str) -> EntitlementResult<bool>;
    async fn stats(&self) -> EntitlementResult<RuleStoreStats>;
    async fn health(&self) -> bool;
}

fn sort_for_evaluation(rules: &mut [Rule]) {
    rules.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then(a.created_at.cmp(&b.created_at))
            .then(a.rule_id.cmp(&b.rule_id))
    });
}

// ---------------- In-memory implementation ----------------

#[derive(Default)]
pub struct MemoryRuleStore {
    rules: RwLock<HashMap<String, Rule>>,
}

impl MemoryRuleStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RuleStore for MemoryRuleStore {
    async fn save(&self, rule: Rule) -> EntitlementResult<()> {
        let mut rules = self.rules.write().await;
        rules.insert(rule.rule_id.clone(), rule);
        Ok(())
    }

    async fn load(&self, rule_id: &str) -> EntitlementResult<Option<Rule>> {
        Ok(self.rules.read().await.get(rule_id).cloned())
    }

    async fn load_all(&self) -> EntitlementResult<Vec<Rule>> {
        let mut rules: Vec<Rule> = self.rules.read().await.values().cloned().collect();
        sort_for_evaluation(&mut rules);
        Ok(rules)
    }

    async fn load_candidates(
        &self,
        tenant_id: &str,
        resource: &str,
    ) -> EntitlementResult<Vec<Rule>> {
        let mut rules: Vec<Rule> = self
            .rules
            .read()
            .await
            .values()
            .filter(|rule| {
                rule.enabled && rule.matches_tenant(tenant_id) && rule.matches_resource(resource)
            })
            .cloned()
            .collect();
        sort_for_evaluation(&mut rules);
        Ok(rules)
    }

    async fn load_for_tenant(&self, tenant_id: &str) -> EntitlementResult<Vec<Rule>> {
        let mut rules: Vec<Rule> = self
            .rules
            .read()
            .await
            .values()
            .filter(|rule| rule.tenant_id.as_deref() == Some(tenant_id))
            .cloned()
            .collect();
        sort_for_evaluation(&mut rules);
        Ok(rules)
    }

    async fn delete(&self, rule_id: &str) -> EntitlementResult<bool> {
        Ok(self.rules.write().await.remove(rule_id).is_some())
    }

    async fn stats(&self) -> EntitlementResult<RuleStoreStats> {
        let rules = self.rules.read().await;
        let mut resources = std::collections::HashSet::new();
        let mut tenants = std::collections::HashSet::new();
        let mut stats = RuleStoreStats {
            total_rules: rules.len() as i64,
            ..Default::default()
        };
        for rule in rules.values() {
            if rule.enabled {
                stats.enabled_rules += 1;
            }
            if rule.tenant_id.is_some() {
                stats.tenant_scoped_rules += 1;
            }
            if rule.user_id.is_some() {
                stats.user_scoped_rules += 1;
            }
            resources.insert(rule.resource.clone());
            if let Some(tenant) = &rule.tenant_id {
                tenants.insert(tenant.clone());
            }
        }
        stats.unique_resources = resources.len() as i64;
        stats.unique_tenants = tenants.len() as i64;
        Ok(stats)
    }

    async fn health(&self) -> bool {
        true
    }
}

// ---------------- PostgreSQL implementation ----------------

pub struct PgRuleStore {
    pool: PgPool,
}

impl PgRuleStore {
    pub async fn connect(dsn: &str) -> EntitlementResult<Self> {
        let pool = PgPoolOptions::new()
            .min_connections(2)
            .max_connections(10)
            .connect(dsn)
            .await
            .map_err(|err| EntitlementError::StoreUnavailable(err.to_string()))?;
        let store = Self { pool };
        store.migrate().await?;
        info!("rule store connected");
        Ok(store)
    }

    async fn migrate(&self) -> EntitlementResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS rules (
                rule_id VARCHAR(255) PRIMARY KEY,
                name VARCHAR(255) NOT NULL,
                description TEXT,
                resource VARCHAR(100) NOT NULL,
                effect VARCHAR(20) NOT NULL,
                conditions JSONB NOT NULL DEFAULT '[]',
                priority INTEGER NOT NULL DEFAULT 0,
                enabled BOOLEAN NOT NULL DEFAULT TRUE,
                tenant_id VARCHAR(255),
                user_id VARCHAR(255),
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                expires_at TIMESTAMPTZ
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|err| EntitlementError::StoreUnavailable(err.to_string()))?;

        for statement in [
            "CREATE INDEX IF NOT EXISTS idx_rules_resource ON rules(resource)",
            "CREATE INDEX IF NOT EXISTS idx_rules_tenant ON rules(tenant_id)",
            "CREATE INDEX IF NOT EXISTS idx_rules_enabled ON rules(enabled)",
            "CREATE INDEX IF NOT EXISTS idx_rules_priority ON rules(priority DESC)",
        ] {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|err| EntitlementError::StoreUnavailable(err.to_string()))?;
        }
        Ok(())
    }

    fn row_to_rule(row: &sqlx::postgres::PgRow) -> EntitlementResult<Rule> {
        let conditions: serde_json::Value = row
            .try_get("conditions")
            .map_err(|err| EntitlementError::StoreUnavailable(err.to_string()))?;
        let conditions = serde_json::from_value(conditions)
            .map_err(|err| EntitlementError::InvalidRule(err.to_string()))?;
        let effect: String = row
            .try_get("effect")
            .map_err(|err| EntitlementError::StoreUnavailable(err.to_string()))?;
        let effect = serde_json::from_value(serde_json::Value::String(effect))
            .map_err(|err| EntitlementError::InvalidRule(err.to_string()))?;

        let get = |name: &str| -> EntitlementResult<String> {
            row.try_get(name)
                .map_err(|err| EntitlementError::StoreUnavailable(err.to_string()))
        };

        Ok(Rule {
            rule_id: get("rule_id")?,
            name: get("name")?,
            description: row.try_get("description").ok(),
            resource: get("resource")?,
            effect,
            conditions,
            priority: row
                .try_get("priority")
                .map_err(|err| EntitlementError::StoreUnavailable(err.to_string()))?,
            enabled: row
                .try_get("enabled")
                .map_err(|err| EntitlementError::StoreUnavailable(err.to_string()))?,
            tenant_id: row.try_get("tenant_id").ok(),
            user_id: row.try_get("user_id").ok(),
            created_at: row
                .try_get("created_at")
                .map_err(|err| EntitlementError::StoreUnavailable(err.to_string()))?,
            updated_at: row
                .try_get("updated_at")
                .map_err(|err| EntitlementError::StoreUnavailable(err.to_string()))?,
            expires_at: row.try_get("expires_at").ok(),
        })
    }
}

#[async_trait]
impl RuleStore for PgRuleStore {
    async fn save(&self, rule: Rule) -> EntitlementResult<()> {
        let conditions = serde_json::to_value(&rule.conditions)
            .map_err(|err| EntitlementError::InvalidRule(err.to_string()))?;
        let effect = match rule.effect {
            crate::model::Effect::Allow => "allow",
            crate::model::Effect::Deny => "deny",
        };
        sqlx::query(
            r#"
            INSERT INTO rules (
                rule_id, name, description, resource, effect, conditions,
                priority, enabled, tenant_id, user_id, created_at, updated_at, expires_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (rule_id) DO UPDATE SET
                name = EXCLUDED.name,
                description = EXCLUDED.description,
                resource = EXCLUDED.resource,
                effect = EXCLUDED.effect,
                conditions = EXCLUDED.conditions,
                priority = EXCLUDED.priority,
                enabled = EXCLUDED.enabled,
                tenant_id = EXCLUDED.tenant_id,
                user_id = EXCLUDED.user_id,
                updated_at = EXCLUDED.updated_at,
                expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(&rule.rule_id)
        .bind(&rule.name)
        .bind(&rule.description)
        .bind(&rule.resource)
        .bind(effect)
        .bind(&conditions)
        .bind(rule.priority)
        .bind(rule.enabled)
        .bind(&rule.tenant_id)
        .bind(&rule.user_id)
        .bind(rule.created_at)
        .bind(rule.updated_at)
        .bind(rule.expires_at)
        .execute(&self.pool)
        .await
        .map_err(|err| EntitlementError::StoreUnavailable(err.to_string()))?;
        Ok(())
    }

    async fn load(&self, rule_id: &str) -> EntitlementResult<Option<Rule>> {
        let row = sqlx::query("SELECT * FROM rules WHERE rule_id = $1")
            .bind(rule_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|err| EntitlementError::StoreUnavailable(err.to_string()))?;
        row.as_ref().map(Self::row_to_rule).transpose()
    }

    async fn load_all(&self) -> EntitlementResult<Vec<Rule>> {
        let rows = sqlx::query("SELECT * FROM rules ORDER BY priority DESC, created_at ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(|err| EntitlementError::StoreUnavailable(err.to_string()))?;
        rows.iter().map(Self::row_to_rule).collect()
    }

    async fn load_candidates(
        &self,
        tenant_id: &str,
        resource: &str,
    ) -> EntitlementResult<Vec<Rule>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM rules
            WHERE enabled = TRUE
              AND (tenant_id IS NULL OR tenant_id = $1 OR tenant_id = $2)
              AND (resource = $3 OR resource = $2)
            ORDER BY priority DESC, created_at ASC
            "#,
        )
        .bind(tenant_id)
        .bind(WILDCARD)
        .bind(resource)
        .fetch_all(&self.pool)
        .await
        .map_err(|err| EntitlementError::StoreUnavailable(err.to_string()))?;
        rows.iter().map(Self::row_to_rule).collect()
    }

    async fn load_for_tenant(&self, tenant_id: &str) -> EntitlementResult<Vec<Rule>> {
        let rows = sqlx::query(
            "SELECT * FROM rules WHERE tenant_id = $1 ORDER BY priority DESC, created_at ASC",
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|err| EntitlementError::StoreUnavailable(err.to_string()))?;
        rows.iter().map(Self::row_to_rule).collect()
    }

    async fn delete(&self, rule_id: &str) -> EntitlementResult<bool> {
        let result = sqlx::query("DELETE FROM rules WHERE rule_id = $1")
            .bind(rule_id)
            .execute(&self.pool)
            .await
            .map_err(|err| EntitlementError::StoreUnavailable(err.to_string()))?;
        Ok(result.rows_affected() == 1)
    }

    async fn stats(&self) -> EntitlementResult<RuleStoreStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total_rules,
                COUNT(*) FILTER (WHERE enabled = TRUE) AS enabled_rules,
                COUNT(*) FILTER (WHERE tenant_id IS NOT NULL) AS tenant_scoped_rules,
                COUNT(*) FILTER (WHERE user_id IS NOT NULL) AS user_scoped_rules,
                COUNT(DISTINCT resource) AS unique_resources,
                COUNT(DISTINCT tenant_id) AS unique_tenants
            FROM rules
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|err| EntitlementError::StoreUnavailable(err.to_string()))?;

        let get = |name: &str| -> i64 { row.try_get(name).unwrap_or(0) };
        Ok(RuleStoreStats {
            total_rules: get("total_rules"),
            enabled_rules: get("enabled_rules"),
            tenant_scoped_rules: get("tenant_scoped_rules"),
            user_scoped_rules: get("user_scoped_rules"),
            unique_resources: get("unique_resources"),
            unique_tenants: get("unique_tenants"),
        })
    }

    async fn health(&self) -> bool {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await.is_ok()
    }
}
