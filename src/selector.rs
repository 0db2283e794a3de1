//! Label selector matching for custom weights.
//!
//! Selectors come in two shapes, an equality map (`matchLabels`) and a list of set-based
//! requirements (`matchExpressions`). A [`LabelSelector`] is the conjunction of both. Every shape
//! implements [`LabelMatcher`], so callers evaluate them uniformly in declaration order.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{
    LabelSelector,
    LabelSelectorRequirement,
};
use std::collections::BTreeMap;
use thiserror::Error;

pub type Labels = BTreeMap<String, String>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SelectorError {
    #[error("invalid label selector operator {operator:?} for key {key:?}")]
    UnknownOperator { key: String, operator: String },
    #[error("label selector operator {operator:?} for key {key:?} requires at least one value")]
    MissingValues { key: String, operator: String },
}

/// A predicate over an object's labels.
pub trait LabelMatcher {
    fn matches(&self, labels: &Labels) -> Result<bool, SelectorError>;
}

impl LabelMatcher for BTreeMap<String, String> {
    fn matches(&self, labels: &Labels) -> Result<bool, SelectorError> {
        Ok(self.iter().all(|(key, value)| labels.get(key) == Some(value)))
    }
}

impl LabelMatcher for LabelSelectorRequirement {
    fn matches(&self, labels: &Labels) -> Result<bool, SelectorError> {
        let values = self.values.as_deref().unwrap_or_default();
        let needs_values = || {
            if values.is_empty() {
                Err(SelectorError::MissingValues {
                    key: self.key.clone(),
                    operator: self.operator.clone(),
                })
            } else {
                Ok(())
            }
        };
        let value = labels.get(&self.key);
        match self.operator.as_str() {
            "In" => {
                needs_values()?;
                Ok(value.map_or(false, |value| values.contains(value)))
            }
            "NotIn" => {
                needs_values()?;
                Ok(value.map_or(true, |value| !values.contains(value)))
            }
            "Exists" => Ok(value.is_some()),
            "DoesNotExist" => Ok(value.is_none()),
            operator => Err(SelectorError::UnknownOperator {
                key: self.key.clone(),
                operator: operator.to_string(),
            }),
        }
    }
}

impl LabelMatcher for [LabelSelectorRequirement] {
    fn matches(&self, labels: &Labels) -> Result<bool, SelectorError> {
        for requirement in self {
            if !requirement.matches(labels)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

impl LabelMatcher for LabelSelector {
    fn matches(&self, labels: &Labels) -> Result<bool, SelectorError> {
        if let Some(match_labels) = &self.match_labels {
            if !match_labels.matches(labels)? {
                return Ok(false);
            }
        }
        match &self.match_expressions {
            Some(expressions) => expressions.as_slice().matches(labels),
            None => Ok(true),
        }
    }
}

/// True if the selector has neither labels nor expressions. An empty selector would match every object.
pub fn is_empty_selector(selector: &LabelSelector) -> bool {
    selector.match_labels.as_ref().map_or(true, BTreeMap::is_empty)
        && selector.match_expressions.as_ref().map_or(true, Vec::is_empty)
}

#[cfg(test)]
#[path = "selector_tests.rs"]
mod selector_tests;
