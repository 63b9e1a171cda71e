//! Scoped variable context for recipe executions
//!
//! Variables live in five disjoint namespaces. References always name the
//! scope they read from (`$step.foo`); unscoped bare field access is handled
//! by callers and falls back to trigger data only.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use crate::path::{apply_indexes, parse_segments};

/// Scope errors
#[derive(Debug, Clone, Error)]
pub enum ScopeError {
    #[error("Unknown variable scope: {0}")]
    UnknownScope(String),
}

/// The five variable scopes, in documentation order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariableScope {
    /// Process-wide, user-configured values
    Global,
    /// Recipe default variables
    Recipe,
    /// Trigger data and execution metadata
    Execution,
    /// Outputs of prior actions in this execution
    Step,
    /// Derived values
    Computed,
}

impl VariableScope {
    /// Parse a scope name as it appears in `$scope.path` references
    pub fn parse(name: &str) -> Result<Self, ScopeError> {
        match name {
            "global" => Ok(Self::Global),
            "recipe" => Ok(Self::Recipe),
            "execution" => Ok(Self::Execution),
            "step" => Ok(Self::Step),
            "computed" => Ok(Self::Computed),
            // `$trigger.x` is shorthand for the trigger data stored in the
            // execution scope, handled by VariableContext::lookup_reference.
            other => Err(ScopeError::UnknownScope(other.to_string())),
        }
    }

    /// Scope name as used in references
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::Recipe => "recipe",
            Self::Execution => "execution",
            Self::Step => "step",
            Self::Computed => "computed",
        }
    }
}

/// Scoped variable storage for one execution
///
/// All scopes are write-once per key except `step`, which grows
/// monotonically as actions complete. Existing keys are never overwritten;
/// attempts to do so are logged and ignored.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VariableContext {
    #[serde(default)]
    pub global: IndexMap<String, Value>,
    #[serde(default)]
    pub recipe: IndexMap<String, Value>,
    #[serde(default)]
    pub execution: IndexMap<String, Value>,
    #[serde(default)]
    pub step: IndexMap<String, Value>,
    #[serde(default)]
    pub computed: IndexMap<String, Value>,
}

impl VariableContext {
    /// Create an empty context
    pub fn new() -> Self {
        Self::default()
    }

    fn scope_map(&self, scope: VariableScope) -> &IndexMap<String, Value> {
        match scope {
            VariableScope::Global => &self.global,
            VariableScope::Recipe => &self.recipe,
            VariableScope::Execution => &self.execution,
            VariableScope::Step => &self.step,
            VariableScope::Computed => &self.computed,
        }
    }

    fn scope_map_mut(&mut self, scope: VariableScope) -> &mut IndexMap<String, Value> {
        match scope {
            VariableScope::Global => &mut self.global,
            VariableScope::Recipe => &mut self.recipe,
            VariableScope::Execution => &mut self.execution,
            VariableScope::Step => &mut self.step,
            VariableScope::Computed => &mut self.computed,
        }
    }

    /// Set a key in a scope; existing keys are write-once and kept
    pub fn set(&mut self, scope: VariableScope, key: impl Into<String>, value: Value) {
        let key = key.into();
        let map = self.scope_map_mut(scope);
        if map.contains_key(&key) {
            warn!(scope = scope.as_str(), key = %key, "Ignoring overwrite of existing variable");
            return;
        }
        map.insert(key, value);
    }

    /// Append an action output to the step scope
    pub fn set_step(&mut self, key: impl Into<String>, value: Value) {
        self.step.insert(key.into(), value);
    }

    /// Look up a dotted path inside one scope
    pub fn lookup(&self, scope: VariableScope, path: &str) -> Option<Value> {
        let segments = parse_segments(path)?;
        let (first, rest) = segments.split_first()?;

        let mut current = self.scope_map(scope).get(&first.key)?;
        current = apply_indexes(current, &first.indexes)?;

        for segment in rest {
            current = current.as_object()?.get(&segment.key)?;
            current = apply_indexes(current, &segment.indexes)?;
        }

        Some(current.clone())
    }

    /// Resolve a `scope.path` reference body (reference text without the `$`)
    ///
    /// `$trigger.x` is accepted as shorthand for `$execution.trigger.x`.
    pub fn lookup_reference(&self, reference: &str) -> Result<Option<Value>, ScopeError> {
        let (scope_name, path) = match reference.split_once('.') {
            Some((s, p)) => (s, Some(p)),
            None => (reference, None),
        };

        if scope_name == "trigger" {
            let path = match path {
                Some(p) => format!("trigger.{}", p),
                None => "trigger".to_string(),
            };
            return Ok(self.lookup(VariableScope::Execution, &path));
        }

        let scope = VariableScope::parse(scope_name)?;
        match path {
            Some(p) => Ok(self.lookup(scope, p)),
            // A bare `$step` style reference names the whole scope
            None => Ok(Some(Value::Object(
                self.scope_map(scope)
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            ))),
        }
    }

    /// Trigger data for unscoped bare field fallback
    pub fn trigger_data(&self) -> Value {
        self.execution.get("trigger").cloned().unwrap_or(Value::Null)
    }

    /// Execution id, if this context belongs to a running execution
    pub fn execution_id(&self) -> Option<&str> {
        self.execution.get("execution_id").and_then(|v| v.as_str())
    }
}
