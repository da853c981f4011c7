use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const WILDCARD: &str = "*";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Effect {
    Allow,
    Deny,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Equals,
    NotEquals,
    In,
    NotIn,
    Contains,
    StartsWith,
    EndsWith,
    GreaterThan,
    LessThan,
    Between,
}

/// One predicate over the request context: (attribute path, operator, value).
/// String values may reference context attributes with `{{path}}` templates,
/// expanded before comparison.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleCondition {
    pub field: String,
    pub operator: ConditionOperator,
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub rule_id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Resource category this rule applies to, `*` for all.
    pub resource: String,
    pub effect: Effect,
    #[serde(default)]
    pub conditions: Vec<RuleCondition>,
    /// Higher priority wins; ties break by earlier creation.
    pub priority: i32,
    pub enabled: bool,
    /// Tenant scope; `None` and `*` both match every tenant.
    #[serde(default)]
    pub tenant_id: Option<String>,
    /// Optional subject scope.
    #[serde(default)]
    pub user_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Rule {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }

    pub fn matches_tenant(&self, tenant_id: &str) -> bool {
        match self.tenant_id.as_deref() {
            None | Some(WILDCARD) => true,
            Some(scope) => scope == tenant_id,
        }
    }

    pub fn matches_resource(&self, resource: &str) -> bool {
        self.resource == WILDCARD || self.resource == resource
    }

    pub fn matches_user(&self, user_id: &str) -> bool {
        match self.user_id.as_deref() {
            None | Some(WILDCARD) => true,
            Some(scope) => scope == user_id,
        }
    }
}

/// Mutable rule fields accepted by create/update.
#[derive(Debug, Clone, Deserialize)]
pub struct RuleDraft {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub resource: String,
    pub effect: Effect,
    #[serde(default)]
    pub conditions: Vec<RuleCondition>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

fn default_enabled() -> bool {
    true
}

/// Inputs of one entitlement check. Context keys participate in condition
/// evaluation and in the decision-cache key, so they are kept sorted.
#[derive(Debug, Clone)]
pub struct CheckRequest {
    pub user_id: String,
    pub tenant_id: String,
    pub resource: String,
    pub action: String,
    pub context: BTreeMap<String, Value>,
}

impl CheckRequest {
    pub fn new(
        user_id: impl Into<String>,
        tenant_id: impl Into<String>,
        resource: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            tenant_id: tenant_id.into(),
            resource: resource.into(),
            action: action.into(),
            context: BTreeMap::new(),
        }
    }

    pub fn with_context(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    pub fn with_roles(self, roles: &[String]) -> Self {
        let roles = Value::Array(roles.iter().map(|r| Value::String(r.clone())).collect());
        self.with_context("roles", roles)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Decision {
    pub allowed: bool,
    pub reason: String,
    pub matched_rule_ids: Vec<String>,
    pub evaluated_count: usize,
}

impl Decision {
    pub fn default_deny(evaluated_count: usize) -> Self {
        Self {
            allowed: false,
            reason: "no rule matched; default deny".to_string(),
            matched_rule_ids: Vec::new(),
            evaluated_count,
        }
    }
}
