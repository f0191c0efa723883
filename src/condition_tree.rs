//! Three-valued evaluation of nested targeting-rule trees.
//!
//! A rule tree is a [`ConditionTree`] of logical operators over leaves. The tree does not know what
//! a leaf means: evaluation takes a leaf-matching function, so the same walker serves audience-id
//! lists and attribute conditions alike.
use serde::{de::DeserializeOwned, Deserialize, Deserializer, Serialize};

/// Result of a three-valued (Kleene) logic evaluation.
///
/// `Some(true)` and `Some(false)` are definite answers. `None` means there was not enough
/// information to decide (e.g., missing attribute or type mismatch). It is never an error.
pub type TriState = Option<bool>;

/// Logical operator of an inner tree node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogicalOperator {
    And,
    Or,
    Not,
}

impl LogicalOperator {
    /// Classify a raw token. Returns `None` for anything that is not an operator token.
    pub fn from_token(token: &str) -> Option<LogicalOperator> {
        match token {
            "and" => Some(LogicalOperator::And),
            "or" => Some(LogicalOperator::Or),
            "not" => Some(LogicalOperator::Not),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LogicalOperator::And => "and",
            LogicalOperator::Or => "or",
            LogicalOperator::Not => "not",
        }
    }
}

/// A parsed rule tree. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub enum ConditionTree<L> {
    /// Logical operator applied to its operands.
    Operator {
        operator: LogicalOperator,
        operands: Vec<ConditionTree<L>>,
    },
    /// A leaf to be matched by the caller-supplied function.
    Leaf(L),
}

impl<L> ConditionTree<L> {
    pub fn and(operands: Vec<ConditionTree<L>>) -> ConditionTree<L> {
        ConditionTree::Operator {
            operator: LogicalOperator::And,
            operands,
        }
    }

    pub fn or(operands: Vec<ConditionTree<L>>) -> ConditionTree<L> {
        ConditionTree::Operator {
            operator: LogicalOperator::Or,
            operands,
        }
    }

    pub fn not(operands: Vec<ConditionTree<L>>) -> ConditionTree<L> {
        ConditionTree::Operator {
            operator: LogicalOperator::Not,
            operands,
        }
    }

    pub fn leaf(leaf: L) -> ConditionTree<L> {
        ConditionTree::Leaf(leaf)
    }

    /// Evaluate the tree using `leaf_match` for leaves.
    ///
    /// - `and` is `false` as soon as any operand is `false`, unknown if no operand was `false`
    ///   but some were unknown, and `true` otherwise.
    /// - `or` is the dual of `and`.
    /// - `not` negates its first operand only; any further operands are ignored. Missing or
    ///   unknown operand gives unknown.
    /// - `and`/`or` without operands give unknown.
    ///
    /// Evaluation never fails.
    pub fn evaluate<F>(&self, leaf_match: F) -> TriState
    where
        F: Fn(&L) -> TriState,
    {
        self.evaluate_with(&leaf_match)
    }

    fn evaluate_with<F>(&self, leaf_match: &F) -> TriState
    where
        F: Fn(&L) -> TriState,
    {
        match self {
            ConditionTree::Leaf(leaf) => leaf_match(leaf),
            ConditionTree::Operator { operator, operands } => match operator {
                LogicalOperator::And => evaluate_and(operands, leaf_match),
                LogicalOperator::Or => evaluate_or(operands, leaf_match),
                LogicalOperator::Not => operands
                    .first()
                    .and_then(|operand| operand.evaluate_with(leaf_match))
                    .map(|result| !result),
            },
        }
    }

    /// Build a tree from its raw JSON form.
    ///
    /// An array whose first element is an operator token (`"and"`, `"or"`, `"not"`) becomes that
    /// operator over the remaining elements. Any other array is an implicit `or` over all of its
    /// elements, so unknown operator tokens are treated as leaves. Everything else is handed to
    /// `parse_leaf`.
    pub fn from_json<F, E>(value: serde_json::Value, parse_leaf: &F) -> Result<ConditionTree<L>, E>
    where
        F: Fn(serde_json::Value) -> Result<L, E>,
    {
        match value {
            serde_json::Value::Array(items) => {
                let mut items = items.into_iter().peekable();
                let explicit = match items.peek() {
                    Some(serde_json::Value::String(token)) => LogicalOperator::from_token(token),
                    _ => None,
                };
                if explicit.is_some() {
                    items.next();
                }

                let operands = items
                    .map(|item| ConditionTree::from_json(item, parse_leaf))
                    .collect::<Result<Vec<_>, E>>()?;

                Ok(ConditionTree::Operator {
                    operator: explicit.unwrap_or(LogicalOperator::Or),
                    operands,
                })
            }
            leaf => Ok(ConditionTree::Leaf(parse_leaf(leaf)?)),
        }
    }
}

fn evaluate_and<L, F>(operands: &[ConditionTree<L>], leaf_match: &F) -> TriState
where
    F: Fn(&L) -> TriState,
{
    let mut saw_unknown = operands.is_empty();
    for operand in operands {
        match operand.evaluate_with(leaf_match) {
            Some(false) => return Some(false),
            Some(true) => {}
            None => saw_unknown = true,
        }
    }
    if saw_unknown {
        None
    } else {
        Some(true)
    }
}

fn evaluate_or<L, F>(operands: &[ConditionTree<L>], leaf_match: &F) -> TriState
where
    F: Fn(&L) -> TriState,
{
    let mut saw_unknown = operands.is_empty();
    for operand in operands {
        match operand.evaluate_with(leaf_match) {
            Some(true) => return Some(true),
            Some(false) => {}
            None => saw_unknown = true,
        }
    }
    if saw_unknown {
        None
    } else {
        Some(false)
    }
}

impl<'de, L: DeserializeOwned> Deserialize<'de> for ConditionTree<L> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = serde_json::Value::deserialize(deserializer)?;
        ConditionTree::from_json(value, &serde_json::from_value)
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{ConditionTree, LogicalOperator, TriState};

    fn leaf(result: TriState) -> ConditionTree<TriState> {
        ConditionTree::leaf(result)
    }

    fn identity(leaf: &TriState) -> TriState {
        *leaf
    }

    const T: TriState = Some(true);
    const F: TriState = Some(false);
    const U: TriState = None;

    #[test]
    fn leaf_uses_matcher() {
        assert_eq!(leaf(T).evaluate(identity), T);
        assert_eq!(leaf(F).evaluate(identity), F);
        assert_eq!(leaf(U).evaluate(identity), U);
    }

    #[test]
    fn and_is_false_if_any_operand_is_false() {
        assert_eq!(ConditionTree::and(vec![leaf(F), leaf(U)]).evaluate(identity), F);
        assert_eq!(ConditionTree::and(vec![leaf(U), leaf(F)]).evaluate(identity), F);
        assert_eq!(ConditionTree::and(vec![leaf(T), leaf(F)]).evaluate(identity), F);
    }

    #[test]
    fn and_is_unknown_without_false_operands() {
        assert_eq!(ConditionTree::and(vec![leaf(T), leaf(U)]).evaluate(identity), U);
        assert_eq!(ConditionTree::and(vec![leaf(T), leaf(T)]).evaluate(identity), T);
    }

    #[test]
    fn or_is_true_if_any_operand_is_true() {
        assert_eq!(ConditionTree::or(vec![leaf(T), leaf(U)]).evaluate(identity), T);
        assert_eq!(ConditionTree::or(vec![leaf(U), leaf(T)]).evaluate(identity), T);
        assert_eq!(ConditionTree::or(vec![leaf(F), leaf(U)]).evaluate(identity), U);
        assert_eq!(ConditionTree::or(vec![leaf(F), leaf(F)]).evaluate(identity), F);
    }

    #[test]
    fn and_or_without_operands_are_unknown() {
        assert_eq!(ConditionTree::<TriState>::and(vec![]).evaluate(identity), U);
        assert_eq!(ConditionTree::<TriState>::or(vec![]).evaluate(identity), U);
    }

    #[test]
    fn not_negates_known_results() {
        assert_eq!(ConditionTree::not(vec![leaf(T)]).evaluate(identity), F);
        assert_eq!(ConditionTree::not(vec![leaf(F)]).evaluate(identity), T);
        assert_eq!(ConditionTree::not(vec![leaf(U)]).evaluate(identity), U);
        assert_eq!(ConditionTree::<TriState>::not(vec![]).evaluate(identity), U);
    }

    #[test]
    fn not_ignores_extra_operands() {
        let tree: ConditionTree<String> = serde_json::from_value(json!(["not", "1", "2", "1"]))
            .expect("audience tree should parse");

        assert_eq!(tree.evaluate(|id| Some(id == "1")), Some(false));
    }

    #[test]
    fn nested_trees() {
        // and(or(U, T), not(F))
        let tree = ConditionTree::and(vec![
            ConditionTree::or(vec![leaf(U), leaf(T)]),
            ConditionTree::not(vec![leaf(F)]),
        ]);
        assert_eq!(tree.evaluate(identity), T);
    }

    #[test]
    fn parses_explicit_operators() {
        let tree: ConditionTree<String> =
            serde_json::from_value(json!(["and", "1", ["or", "2", "3"]])).unwrap();

        assert_eq!(
            tree,
            ConditionTree::and(vec![
                ConditionTree::leaf("1".to_owned()),
                ConditionTree::or(vec![
                    ConditionTree::leaf("2".to_owned()),
                    ConditionTree::leaf("3".to_owned()),
                ]),
            ])
        );
    }

    #[test]
    fn array_without_operator_is_implicit_or() {
        let tree: ConditionTree<String> = serde_json::from_value(json!(["1", "2"])).unwrap();

        assert_eq!(
            tree,
            ConditionTree::or(vec![
                ConditionTree::leaf("1".to_owned()),
                ConditionTree::leaf("2".to_owned()),
            ])
        );
        assert_eq!(tree.evaluate(|id| Some(id == "2")), Some(true));
    }

    #[test]
    fn unknown_operator_token_is_a_leaf() {
        let tree: ConditionTree<String> = serde_json::from_value(json!(["xor", "1"])).unwrap();

        let ConditionTree::Operator { operator, operands } = &tree else {
            panic!("expected an operator node, got {tree:?}");
        };
        assert_eq!(*operator, LogicalOperator::Or);
        assert_eq!(operands.len(), 2);
        assert_eq!(tree.evaluate(|id| Some(id == "xor")), Some(true));
    }

    #[test]
    fn empty_array_is_unknown() {
        let tree: ConditionTree<String> = serde_json::from_value(json!([])).unwrap();
        assert_eq!(tree.evaluate(|_| Some(true)), None);
    }

    #[test]
    fn leaf_parse_failure_is_reported() {
        let result = serde_json::from_value::<ConditionTree<String>>(json!(["and", 42]));
        assert!(result.is_err());
    }
}
