//! Leaf matching for targeting conditions on user attributes.
use serde::{Deserialize, Serialize};

use crate::{
    condition_tree::{ConditionTree, TriState},
    AttributeValue, Attributes,
};

/// Kind of a condition leaf. Only [`ConditionType::CustomAttribute`] leaves can be matched against
/// user attributes; other kinds evaluate to unknown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionType {
    CustomAttribute,
    /// Condition kinds introduced after this version of the library, or a missing kind.
    #[default]
    #[serde(other)]
    Unrecognized,
}

/// How the attribute value is compared to the condition value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchKind {
    /// Strict equality of string, number, or boolean values of the same type.
    Exact,
    /// Attribute is present and not null.
    Exists,
    /// Condition value is a substring of the attribute value. Both must be strings.
    Substring,
    /// Attribute is greater than condition value. Both must be finite numbers.
    Gt,
    /// Attribute is less than condition value. Both must be finite numbers.
    Lt,
    /// Match kinds introduced after this version of the library.
    #[serde(other)]
    Unrecognized,
}

/// A leaf of a targeting-rule tree that checks a single user attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomAttributeCondition {
    /// Attribute name. A leaf without a name evaluates to unknown.
    #[serde(default)]
    pub name: String,
    /// Defaults to [`ConditionType::Unrecognized`] when absent.
    #[serde(rename = "type", default)]
    pub condition_type: ConditionType,
    /// Defaults to [`MatchKind::Exact`] when absent.
    #[serde(rename = "match", default, skip_serializing_if = "Option::is_none")]
    pub match_kind: Option<MatchKind>,
    /// Value to compare the attribute against. Non-primitive values never match.
    #[serde(default)]
    pub value: serde_json::Value,
}

impl CustomAttributeCondition {
    /// Evaluate the condition against `attributes`.
    ///
    /// Returns `None` (unknown) if the condition cannot be applied: unrecognized condition type or
    /// match kind, missing name or attribute, or incompatible value types.
    pub fn evaluate(&self, attributes: &Attributes) -> TriState {
        if self.condition_type != ConditionType::CustomAttribute || self.name.is_empty() {
            log::debug!(target: "decision_core", name = self.name.as_str(); "skipping condition of unrecognized type");
            return None;
        }

        let attribute = attributes.get(&self.name);
        match self.match_kind.unwrap_or(MatchKind::Exact) {
            MatchKind::Exists => Some(attribute.is_some_and(|value| !value.is_null())),
            MatchKind::Exact => self.exact(attribute?),
            MatchKind::Substring => {
                let haystack = attribute?.as_str()?;
                let needle = self.value.as_str()?;
                Some(haystack.contains(needle))
            }
            MatchKind::Gt => Some(attribute?.as_finite_number()? > self.finite_number()?),
            MatchKind::Lt => Some(attribute?.as_finite_number()? < self.finite_number()?),
            MatchKind::Unrecognized => {
                log::debug!(target: "decision_core", name = self.name.as_str(); "skipping condition with unrecognized match kind");
                None
            }
        }
    }

    fn exact(&self, attribute: &AttributeValue) -> TriState {
        match (&self.value, attribute) {
            (serde_json::Value::String(expected), AttributeValue::String(actual)) => {
                Some(expected == actual)
            }
            (serde_json::Value::Bool(expected), AttributeValue::Boolean(actual)) => {
                Some(expected == actual)
            }
            (serde_json::Value::Number(_), AttributeValue::Number(_)) => {
                Some(self.finite_number()? == attribute.as_finite_number()?)
            }
            _ => None,
        }
    }

    fn finite_number(&self) -> Option<f64> {
        self.value.as_f64().filter(|n| n.is_finite())
    }
}

impl ConditionTree<CustomAttributeCondition> {
    /// Evaluate the whole tree against `attributes` using [`CustomAttributeCondition::evaluate`]
    /// for leaves.
    pub fn matches(&self, attributes: &Attributes) -> TriState {
        self.evaluate(|condition| condition.evaluate(attributes))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use serde_json::json;

    use super::{ConditionType, CustomAttributeCondition, MatchKind};
    use crate::{condition_tree::ConditionTree, Attributes};

    fn condition(match_kind: &str, value: serde_json::Value) -> CustomAttributeCondition {
        serde_json::from_value(json!({
            "name": "field",
            "type": "custom_attribute",
            "match": match_kind,
            "value": value,
        }))
        .unwrap()
    }

    fn field(value: impl Into<crate::AttributeValue>) -> Attributes {
        HashMap::from([("field".to_owned(), value.into())])
    }

    #[test]
    fn parses_leaf() {
        let leaf: CustomAttributeCondition = serde_json::from_value(json!({
            "name": "browser",
            "type": "custom_attribute",
            "value": "firefox",
        }))
        .unwrap();

        assert_eq!(leaf.condition_type, ConditionType::CustomAttribute);
        assert_eq!(leaf.match_kind, None);
        assert_eq!(leaf.value, json!("firefox"));
    }

    #[test]
    fn unrecognized_tokens_parse() {
        let leaf: CustomAttributeCondition = serde_json::from_value(json!({
            "name": "browser",
            "type": "third_party_dimension",
            "match": "semver_eq",
            "value": "1.0.0",
        }))
        .unwrap();

        assert_eq!(leaf.condition_type, ConditionType::Unrecognized);
        assert_eq!(leaf.match_kind, Some(MatchKind::Unrecognized));
    }

    #[test]
    fn exact_is_default_match() {
        let leaf: CustomAttributeCondition = serde_json::from_value(json!({
            "name": "field",
            "type": "custom_attribute",
            "value": "safari",
        }))
        .unwrap();

        assert_eq!(leaf.evaluate(&field("safari")), Some(true));
        assert_eq!(leaf.evaluate(&field("chrome")), Some(false));
    }

    #[test]
    fn exact() {
        assert_eq!(condition("exact", json!(true)).evaluate(&field(true)), Some(true));
        assert_eq!(condition("exact", json!(true)).evaluate(&field(false)), Some(false));
        assert_eq!(condition("exact", json!(42)).evaluate(&field(42.0)), Some(true));
        assert_eq!(condition("exact", json!(42)).evaluate(&field(43.0)), Some(false));
    }

    #[test]
    fn exact_is_unknown_on_type_mismatch() {
        assert_eq!(condition("exact", json!("42")).evaluate(&field(42.0)), None);
        assert_eq!(condition("exact", json!(true)).evaluate(&field("true")), None);
        assert_eq!(condition("exact", json!(["a"])).evaluate(&field("a")), None);
        assert_eq!(condition("exact", json!(1)).evaluate(&field(f64::INFINITY)), None);
    }

    #[test]
    fn exact_is_unknown_on_missing_attribute() {
        assert_eq!(condition("exact", json!("a")).evaluate(&HashMap::new()), None);
        assert_eq!(
            condition("exact", json!("a")).evaluate(&field(crate::AttributeValue::Null)),
            None
        );
    }

    #[test]
    fn exists() {
        let leaf = condition("exists", serde_json::Value::Null);
        assert_eq!(leaf.evaluate(&field("anything")), Some(true));
        assert_eq!(leaf.evaluate(&field(0.0)), Some(true));
        assert_eq!(leaf.evaluate(&field(crate::AttributeValue::Null)), Some(false));
        assert_eq!(leaf.evaluate(&HashMap::new()), Some(false));
    }

    #[test]
    fn substring() {
        let leaf = condition("substring", json!("buy now"));
        assert_eq!(leaf.evaluate(&field("Limited time, buy now!")), Some(true));
        assert_eq!(leaf.evaluate(&field("Limited time only")), Some(false));
        assert_eq!(leaf.evaluate(&field(10.0)), None);
        assert_eq!(condition("substring", json!(10)).evaluate(&field("10")), None);
    }

    #[test]
    fn gt() {
        let leaf = condition("gt", json!(48.2));
        assert_eq!(leaf.evaluate(&field(48.3)), Some(true));
        assert_eq!(leaf.evaluate(&field(48.2)), Some(false));
        assert_eq!(leaf.evaluate(&field("a long way")), None);
        assert_eq!(leaf.evaluate(&field(f64::NAN)), None);
        assert_eq!(condition("gt", json!("48")).evaluate(&field(50.0)), None);
    }

    #[test]
    fn lt() {
        let leaf = condition("lt", json!(48.2));
        assert_eq!(leaf.evaluate(&field(48.1)), Some(true));
        assert_eq!(leaf.evaluate(&field(48.2)), Some(false));
        assert_eq!(leaf.evaluate(&field(true)), None);
    }

    #[test]
    fn unrecognized_match_kind_is_unknown() {
        assert_eq!(condition("semver_eq", json!("1.0.0")).evaluate(&field("1.0.0")), None);
    }

    #[test]
    fn unrecognized_condition_type_is_unknown() {
        let leaf: CustomAttributeCondition = serde_json::from_value(json!({
            "name": "field",
            "type": "third_party_dimension",
            "match": "exists",
        }))
        .unwrap();

        assert_eq!(leaf.evaluate(&field("present")), None);
    }

    #[test]
    fn tree_matches_attributes() {
        let tree: ConditionTree<CustomAttributeCondition> = serde_json::from_value(json!([
            "and",
            ["or", {"name": "plan", "type": "custom_attribute", "value": "premium"}],
            ["not", {"name": "age", "type": "custom_attribute", "match": "lt", "value": 18}],
        ]))
        .unwrap();

        let adult_premium: Attributes = HashMap::from([
            ("plan".to_owned(), "premium".into()),
            ("age".to_owned(), 30.0.into()),
        ]);
        let minor_premium: Attributes = HashMap::from([
            ("plan".to_owned(), "premium".into()),
            ("age".to_owned(), 12.0.into()),
        ]);
        let premium_without_age: Attributes =
            HashMap::from([("plan".to_owned(), "premium".into())]);
        let free_without_age: Attributes = HashMap::from([("plan".to_owned(), "free".into())]);

        assert_eq!(tree.matches(&adult_premium), Some(true));
        assert_eq!(tree.matches(&minor_premium), Some(false));
        assert_eq!(tree.matches(&premium_without_age), None);
        assert_eq!(tree.matches(&free_without_age), Some(false));
    }

    #[test]
    fn incomplete_leaf_degrades_to_unknown() {
        let tree: ConditionTree<CustomAttributeCondition> = serde_json::from_value(json!([
            "or",
            {"name": "plan", "type": "custom_attribute", "value": "premium"},
            {"name": "age", "match": "gt", "value": 18},
            {"type": "custom_attribute", "match": "exists"},
        ]))
        .unwrap();

        let free_adult: Attributes = HashMap::from([
            ("plan".to_owned(), "free".into()),
            ("age".to_owned(), 30.0.into()),
        ]);
        let premium: Attributes = HashMap::from([("plan".to_owned(), "premium".into())]);

        // The untyped and unnamed leaves are unknown, so "free" can't be ruled out.
        assert_eq!(tree.matches(&free_adult), None);
        assert_eq!(tree.matches(&premium), Some(true));
    }
}
