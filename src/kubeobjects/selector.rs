//! Label-selector evaluation
//!
//! Evaluates `LabelSelector` objects against label maps the way the API
//! server does: match labels AND every match expression. An empty selector
//! matches everything; callers model "no selector" as no match themselves.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;

/// Whether `selector` matches the given label map
pub fn selector_matches(selector: &LabelSelector, labels: &BTreeMap<String, String>) -> bool {
    if let Some(match_labels) = &selector.match_labels {
        for (key, value) in match_labels {
            if labels.get(key) != Some(value) {
                return false;
            }
        }
    }

    if let Some(expressions) = &selector.match_expressions {
        for expression in expressions {
            let current = labels.get(&expression.key);
            let values = expression.values.as_deref().unwrap_or_default();

            let matched = match expression.operator.as_str() {
                "In" => current.is_some_and(|v| values.contains(v)),
                "NotIn" => !current.is_some_and(|v| values.contains(v)),
                "Exists" => current.is_some(),
                "DoesNotExist" => current.is_none(),
                // unknown operators never match, mirroring apimachinery's
                // refusal to build a selector for them
                _ => false,
            };

            if !matched {
                return false;
            }
        }
    }

    true
}
