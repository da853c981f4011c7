use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A per-topic filter entry: payload field path → literal, membership list,
/// or numeric range.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterValue {
    /// `{min, max}` — min inclusive, max exclusive. Either bound may be
    /// omitted.
    Range {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max: Option<f64>,
    },
    Membership(Vec<Value>),
    Literal(Value),
}

pub type FilterMap = HashMap<String, FilterValue>;

fn resolve_path<'a>(payload: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = payload;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left.as_f64(), right.as_f64()) {
        (Some(a), Some(b)) => a == b,
        _ => left == right,
    }
}

impl FilterValue {
    pub fn matches(&self, target: &Value) -> bool {
        match self {
            FilterValue::Range { min, max } => {
                let Some(value) = target.as_f64() else {
                    return false;
                };
                if let Some(min) = min {
                    if value < *min {
                        return false;
                    }
                }
                if let Some(max) = max {
                    if value >= *max {
                        return false;
                    }
                }
                true
            }
            FilterValue::Membership(items) => {
                items.iter().any(|item| values_equal(item, target))
            }
            FilterValue::Literal(expected) => values_equal(expected, target),
        }
    }
}

/// A payload passes when every filter entry matches; a missing field fails
/// that entry.
pub fn payload_matches(filters: &FilterMap, payload: &Value) -> bool {
    filters.iter().all(|(path, filter)| {
        resolve_path(payload, path)
            .map(|target| filter.matches(target))
            .unwrap_or(false)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn filters(raw: Value) -> FilterMap {
        serde_json::from_value(raw).unwrap()
    }

    #[test]
    fn literal_filter_matches_exactly() {
        let filters = filters(json!({"instrument": "BRN"}));
        assert!(payload_matches(&filters, &json!({"instrument": "BRN", "price": 52.5})));
        assert!(!payload_matches(&filters, &json!({"instrument": "WTI"})));
    }

    #[test]
    fn membership_filter_accepts_listed_values() {
        let filters = filters(json!({"instrument": ["BRN", "WTI"]}));
        assert!(payload_matches(&filters, &json!({"instrument": "WTI"})));
        assert!(!payload_matches(&filters, &json!({"instrument": "TTF"})));
    }

    #[test]
    fn range_filter_is_closed_open() {
        let filters = filters(json!({"price": {"min": 50.0, "max": 55.0}}));
        assert!(payload_matches(&filters, &json!({"price": 50.0})));
        assert!(payload_matches(&filters, &json!({"price": 54.9})));
        assert!(!payload_matches(&filters, &json!({"price": 55.0})));
        assert!(!payload_matches(&filters, &json!({"price": 49.9})));
    }

    #[test]
    fn open_ended_ranges() {
        let min_only = filters(json!({"price": {"min": 50.0}}));
        assert!(payload_matches(&min_only, &json!({"price": 1000.0})));
        let max_only = filters(json!({"price": {"max": 50.0}}));
        assert!(payload_matches(&max_only, &json!({"price": -1.0})));
    }

    #[test]
    fn missing_field_never_matches() {
        let filters = filters(json!({"instrument": "BRN"}));
        assert!(!payload_matches(&filters, &json!({"price": 52.5})));
    }

    #[test]
    fn nested_paths_resolve() {
        let filters = filters(json!({"meta.region": "EU"}));
        assert!(payload_matches(&filters, &json!({"meta": {"region": "EU"}})));
        assert!(!payload_matches(&filters, &json!({"meta": {"region": "US"}})));
    }

    #[test]
    fn numeric_literal_coerces_across_int_and_float() {
        let filters = filters(json!({"price": 52}));
        assert!(payload_matches(&filters, &json!({"price": 52.0})));
    }

    #[test]
    fn empty_filter_map_matches_everything() {
        assert!(payload_matches(&FilterMap::new(), &json!({"anything": 1})));
    }
}
