pub mod cache;
pub mod engine;
pub mod error;
pub mod model;
pub mod store;

pub use cache::DecisionCache;
pub use engine::EntitlementEngine;
pub use error::{EntitlementError, EntitlementResult};
pub use model::{
    CheckRequest, ConditionOperator, Decision, Effect, Rule, RuleCondition, RuleDraft,
};
pub use store::{MemoryRuleStore, PgRuleStore, RuleStore, RuleStoreStats};
