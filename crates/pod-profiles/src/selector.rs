use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};
use snafu::Snafu;

type Result<T, E = SelectorError> = std::result::Result<T, E>;

#[derive(Clone, Debug, PartialEq, Eq, Snafu)]
pub enum SelectorError {
    #[snafu(display("label selector with binary operator {operator:?} must have values"))]
    LabelSelectorBinaryOperatorWithoutValues { operator: String },

    #[snafu(display("label selector with unary operator {operator:?} must not have values"))]
    LabelSelectorUnaryOperatorWithValues { operator: String },

    #[snafu(display("labelSelector has an invalid operator {operator:?}"))]
    LabelSelectorInvalidOperator { operator: String },
}

/// This trait extends the functionality of [`LabelSelector`].
pub trait LabelSelectorExt {
    /// Checks whether the selector is well-formed, without evaluating it.
    fn validate(&self) -> Result<()>;

    /// Evaluates the selector against a label set using the standard Kubernetes
    /// semantics: every `matchLabels` pair must be present with an equal value and every
    /// `matchExpressions` requirement must hold.
    ///
    /// An empty selector (no labels and no expressions) matches every label set,
    /// including the empty one.
    fn matches(&self, labels: &BTreeMap<String, String>) -> Result<bool>;
}

impl LabelSelectorExt for LabelSelector {
    fn validate(&self) -> Result<()> {
        self.match_expressions
            .iter()
            .flatten()
            .try_for_each(|requirement| evaluate(requirement, &BTreeMap::new()).map(|_| ()))
    }

    fn matches(&self, labels: &BTreeMap<String, String>) -> Result<bool> {
        // Evaluate every expression first so malformed selectors never match by accident
        let mut matched = true;
        for requirement in self.match_expressions.iter().flatten() {
            matched &= evaluate(requirement, labels)?;
        }

        let labels_match = self
            .match_labels
            .iter()
            .flatten()
            .all(|(key, value)| labels.get(key) == Some(value));

        Ok(matched && labels_match)
    }
}

fn evaluate(
    requirement: &LabelSelectorRequirement,
    labels: &BTreeMap<String, String>,
) -> Result<bool> {
    let values = requirement.values.as_deref().unwrap_or_default();
    let value = labels.get(&requirement.key);
    match requirement.operator.as_str() {
        operator @ ("In" | "NotIn") => {
            if values.is_empty() {
                return LabelSelectorBinaryOperatorWithoutValuesSnafu { operator }.fail();
            }
            let contained = value.is_some_and(|value| values.contains(value));
            Ok(if operator == "In" {
                contained
            } else {
                !contained
            })
        }
        operator @ ("Exists" | "DoesNotExist") => {
            if !values.is_empty() {
                return LabelSelectorUnaryOperatorWithValuesSnafu { operator }.fail();
            }
            Ok(value.is_some() == (operator == "Exists"))
        }
        operator => LabelSelectorInvalidOperatorSnafu { operator }.fail(),
    }
}

/// Decides whether a profile with the given selector is picked up implicitly for a label set.
///
/// A profile without a selector never matches implicitly.
pub fn select(selector: Option<&LabelSelector>, labels: &BTreeMap<String, String>) -> Result<bool> {
    match selector {
        Some(selector) => selector.matches(labels),
        None => Ok(false),
    }
}
