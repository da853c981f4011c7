use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Entitlement mapping for one bus topic: the (resource, action) pair the
/// engine is consulted with on subscribe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicInfo {
    pub resource: String,
    #[serde(default = "default_action")]
    pub action: String,
}

fn default_action() -> String {
    "read".to_string()
}

#[derive(Debug, Clone)]
pub struct TopicTable {
    topics: HashMap<String, TopicInfo>,
}

impl TopicTable {
    pub fn from_json(raw: &str) -> anyhow::Result<Self> {
        let topics: HashMap<String, TopicInfo> = serde_json::from_str(raw)?;
        Ok(Self { topics })
    }

    pub fn defaults() -> Self {
        let mut topics = HashMap::new();
        for topic in [
            "pricing.updates.v1",
            "pricing.curve.updates.v1",
            "pricing.instrument.updates.v1",
            "market.data.v1",
        ] {
            topics.insert(
                topic.to_string(),
                TopicInfo {
                    resource: "market_data".to_string(),
                    action: "read".to_string(),
                },
            );
        }
        Self { topics }
    }

    pub fn get(&self, topic: &str) -> Option<&TopicInfo> {
        self.topics.get(topic)
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.topics.contains_key(topic)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.topics.keys().cloned().collect();
        names.sort();
        names
    }
}
