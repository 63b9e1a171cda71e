//! Condition types
//!
//! A condition is either a leaf `{field, operator, value}` test or a group
//! `{conditions, logic}` combining children with AND/OR. The operator is
//! kept as a string until evaluation so an unknown operator is a hard
//! evaluation error rather than a silent false.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Condition errors
#[derive(Debug, Error)]
pub enum ConditionError {
    #[error("Unsupported operator: {0}")]
    UnsupportedOperator(String),

    #[error("Unknown function: {0}")]
    UnknownFunction(String),

    #[error("Invalid function arguments for {name}: {reason}")]
    InvalidArguments { name: String, reason: String },

    #[error("Invalid regex pattern: {0}")]
    InvalidRegex(String),

    #[error("Invalid expression: {0}")]
    InvalidExpression(String),

    #[error(transparent)]
    Scope(#[from] wf_core::ScopeError),
}

/// Result type for condition operations
pub type ConditionResult<T> = Result<T, ConditionError>;

/// A condition tree node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Condition {
    /// Group of conditions combined with AND/OR logic
    Group(ConditionGroup),

    /// Leaf comparison of a field against a value
    Leaf(ConditionLeaf),
}

impl Condition {
    /// Create a leaf condition
    pub fn leaf(field: impl Into<String>, operator: impl Into<String>, value: Value) -> Self {
        Condition::Leaf(ConditionLeaf {
            field: field.into(),
            operator: operator.into(),
            value,
        })
    }

    /// Create an AND group
    pub fn all(conditions: Vec<Condition>) -> Self {
        Condition::Group(ConditionGroup {
            conditions,
            logic: Logic::And,
        })
    }

    /// Create an OR group
    pub fn any(conditions: Vec<Condition>) -> Self {
        Condition::Group(ConditionGroup {
            conditions,
            logic: Logic::Or,
        })
    }
}

/// Group node: child conditions plus combining logic
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionGroup {
    /// Child conditions
    pub conditions: Vec<Condition>,

    /// AND or OR
    #[serde(default)]
    pub logic: Logic,
}

/// Leaf node: one comparison
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionLeaf {
    /// Field reference: bare name, dotted path, `$scope.path`, or `fn(args)`
    pub field: String,

    /// Operator name (validated at evaluation time)
    pub operator: String,

    /// Comparison value; strings may themselves be references or calls
    #[serde(default)]
    pub value: Value,
}

/// Combining logic for condition groups
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Logic {
    #[default]
    And,
    Or,
}

/// The supported comparison operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Equals,
    NotEquals,
    GreaterThan,
    GreaterThanOrEqual,
    LessThan,
    LessThanOrEqual,
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    In,
    NotIn,
    Exists,
    NotExists,
    IsEmpty,
    IsNotEmpty,
    Regex,
}

impl Operator {
    /// Parse an operator name; unknown names are a hard error
    pub fn parse(name: &str) -> ConditionResult<Self> {
        match name {
            "equals" => Ok(Self::Equals),
            "not_equals" => Ok(Self::NotEquals),
            "greater_than" => Ok(Self::GreaterThan),
            "greater_than_or_equal" => Ok(Self::GreaterThanOrEqual),
            "less_than" => Ok(Self::LessThan),
            "less_than_or_equal" => Ok(Self::LessThanOrEqual),
            "contains" => Ok(Self::Contains),
            "not_contains" => Ok(Self::NotContains),
            "starts_with" => Ok(Self::StartsWith),
            "ends_with" => Ok(Self::EndsWith),
            "in" => Ok(Self::In),
            "not_in" => Ok(Self::NotIn),
            "exists" => Ok(Self::Exists),
            "not_exists" => Ok(Self::NotExists),
            "is_empty" => Ok(Self::IsEmpty),
            "is_not_empty" => Ok(Self::IsNotEmpty),
            "regex" => Ok(Self::Regex),
            other => Err(ConditionError::UnsupportedOperator(other.to_string())),
        }
    }
}
