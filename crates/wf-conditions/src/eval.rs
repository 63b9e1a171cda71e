//! Condition evaluation
//!
//! Field/value resolution order: `$scope.path` variable reference, then
//! registered function call, then dotted path into the event data, then
//! bare property on the event data. Missing data resolves to null so the
//! exists/is_empty operators stay meaningful.

use regex::RegexBuilder;
use serde_json::Value;
use std::sync::Arc;
use tracing::trace;
use wf_core::{get_path, VariableContext};

use crate::condition::{Condition, ConditionError, ConditionLeaf, ConditionResult, Logic, Operator};
use crate::functions::FunctionRegistry;

/// State-free condition evaluator with a function registry
pub struct ConditionEvaluator {
    functions: Arc<FunctionRegistry>,
}

impl ConditionEvaluator {
    /// Create an evaluator with the built-in functions
    pub fn new() -> Self {
        Self {
            functions: Arc::new(FunctionRegistry::with_defaults()),
        }
    }

    /// Create an evaluator with a custom function registry
    pub fn with_functions(functions: Arc<FunctionRegistry>) -> Self {
        Self { functions }
    }

    /// The function registry used for `name(args)` expressions
    pub fn functions(&self) -> &Arc<FunctionRegistry> {
        &self.functions
    }

    /// Evaluate one condition against event data and a variable context
    pub fn evaluate(
        &self,
        condition: &Condition,
        data: &Value,
        vars: &VariableContext,
    ) -> ConditionResult<bool> {
        match condition {
            Condition::Group(group) => {
                self.evaluate_all(&group.conditions, data, vars, group.logic)
            }
            Condition::Leaf(leaf) => self.evaluate_leaf(leaf, data, vars),
        }
    }

    /// Evaluate a flat list with AND/OR short-circuiting
    ///
    /// An empty list vacuously passes regardless of logic.
    pub fn evaluate_all(
        &self,
        conditions: &[Condition],
        data: &Value,
        vars: &VariableContext,
        logic: Logic,
    ) -> ConditionResult<bool> {
        if conditions.is_empty() {
            return Ok(true);
        }

        match logic {
            Logic::And => {
                for condition in conditions {
                    if !self.evaluate(condition, data, vars)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Logic::Or => {
                for condition in conditions {
                    if self.evaluate(condition, data, vars)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
        }
    }

    fn evaluate_leaf(
        &self,
        leaf: &ConditionLeaf,
        data: &Value,
        vars: &VariableContext,
    ) -> ConditionResult<bool> {
        let operator = Operator::parse(&leaf.operator)?;
        let field_value = self.resolve_expression(&leaf.field, data, vars)?;
        let compare_value = self.resolve_value(&leaf.value, data, vars)?;

        let result = apply_operator(operator, &field_value, &compare_value)?;
        trace!(
            field = %leaf.field,
            operator = %leaf.operator,
            result = result,
            "Evaluated condition leaf"
        );
        Ok(result)
    }

    /// Resolve a field expression to a value
    ///
    /// Used for condition fields and by the variable resolver's template
    /// grammar. Missing references and paths resolve to null.
    pub fn resolve_expression(
        &self,
        expr: &str,
        data: &Value,
        vars: &VariableContext,
    ) -> ConditionResult<Value> {
        let expr = expr.trim();

        if let Some(reference) = expr.strip_prefix('$') {
            return Ok(vars.lookup_reference(reference)?.unwrap_or(Value::Null));
        }

        if let Some((name, raw_args)) = parse_function_call(expr) {
            let mut args = Vec::with_capacity(raw_args.len());
            for raw in &raw_args {
                args.push(self.resolve_argument(raw, data, vars)?);
            }
            return self.functions.call(name, &args);
        }

        if expr.contains('.') || expr.contains('[') {
            return Ok(get_path(data, expr).cloned().unwrap_or(Value::Null));
        }

        Ok(data.get(expr).cloned().unwrap_or(Value::Null))
    }

    /// Resolve a condition's comparison value
    ///
    /// Strings that are `$references` or `name(args)` calls are resolved;
    /// everything else is a literal.
    fn resolve_value(
        &self,
        value: &Value,
        data: &Value,
        vars: &VariableContext,
    ) -> ConditionResult<Value> {
        if let Value::String(s) = value {
            let trimmed = s.trim();
            if let Some(reference) = trimmed.strip_prefix('$') {
                return Ok(vars.lookup_reference(reference)?.unwrap_or(Value::Null));
            }
            if parse_function_call(trimmed).is_some() {
                return self.resolve_expression(trimmed, data, vars);
            }
        }
        Ok(value.clone())
    }

    fn resolve_argument(
        &self,
        raw: &str,
        data: &Value,
        vars: &VariableContext,
    ) -> ConditionResult<Value> {
        let raw = raw.trim();

        if (raw.starts_with('"') && raw.ends_with('"') && raw.len() >= 2)
            || (raw.starts_with('\'') && raw.ends_with('\'') && raw.len() >= 2)
        {
            return Ok(Value::String(raw[1..raw.len() - 1].to_string()));
        }
        if let Ok(n) = raw.parse::<f64>() {
            if let Some(number) = serde_json::Number::from_f64(n) {
                return Ok(Value::Number(number));
            }
        }
        match raw {
            "true" => return Ok(Value::Bool(true)),
            "false" => return Ok(Value::Bool(false)),
            "null" => return Ok(Value::Null),
            _ => {}
        }

        self.resolve_expression(raw, data, vars)
    }
}

impl Default for ConditionEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse `name(args)` syntax: identifier head, balanced parens to the end
fn parse_function_call(expr: &str) -> Option<(&str, Vec<String>)> {
    let open = expr.find('(')?;
    if open == 0 || !expr.ends_with(')') {
        return None;
    }

    let name = &expr[..open];
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return None;
    }

    let body = &expr[open + 1..expr.len() - 1];
    Some((name, split_call_args(body)?))
}

/// Split call arguments at top-level commas, respecting quotes and parens
fn split_call_args(body: &str) -> Option<Vec<String>> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut depth: i32 = 0;
    let mut quote: Option<char> = None;

    for c in body.chars() {
        match quote {
            Some(q) => {
                current.push(c);
                if c == q {
                    quote = None;
                }
            }
            None => match c {
                '"' | '\'' => {
                    quote = Some(c);
                    current.push(c);
                }
                '(' => {
                    depth += 1;
                    current.push(c);
                }
                ')' => {
                    depth -= 1;
                    if depth < 0 {
                        return None;
                    }
                    current.push(c);
                }
                ',' if depth == 0 => {
                    args.push(current.trim().to_string());
                    current.clear();
                }
                _ => current.push(c),
            },
        }
    }

    if depth != 0 || quote.is_some() {
        return None;
    }

    let last = current.trim();
    if !last.is_empty() {
        args.push(last.to_string());
    } else if !args.is_empty() {
        // Trailing comma
        return None;
    }

    Some(args)
}

fn to_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Loose equality: numbers compare numerically across representations
fn loose_eq(a: &Value, b: &Value) -> bool {
    if a == b {
        return true;
    }
    if let (Some(x), Some(y)) = (to_f64(a), to_f64(b)) {
        return x == y;
    }
    false
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

fn contains(field: &Value, needle: &Value) -> bool {
    match field {
        // Case-insensitive substring for strings
        Value::String(s) => s
            .to_lowercase()
            .contains(&value_to_string(needle).to_lowercase()),
        Value::Array(items) => items.iter().any(|item| loose_eq(item, needle)),
        Value::Object(map) => map.contains_key(&value_to_string(needle)),
        _ => false,
    }
}

/// Membership: array membership, or substring fallback for strings
fn is_in(field: &Value, collection: &Value) -> bool {
    match collection {
        Value::Array(items) => items.iter().any(|item| loose_eq(item, field)),
        Value::String(s) => s
            .to_lowercase()
            .contains(&value_to_string(field).to_lowercase()),
        _ => false,
    }
}

fn compare(field: &Value, other: &Value) -> Option<std::cmp::Ordering> {
    if let (Some(a), Some(b)) = (to_f64(field), to_f64(other)) {
        return a.partial_cmp(&b);
    }
    if let (Value::String(a), Value::String(b)) = (field, other) {
        return Some(a.cmp(b));
    }
    None
}

fn apply_operator(operator: Operator, field: &Value, value: &Value) -> ConditionResult<bool> {
    use std::cmp::Ordering;

    let result = match operator {
        Operator::Equals => loose_eq(field, value),
        Operator::NotEquals => !loose_eq(field, value),
        Operator::GreaterThan => compare(field, value) == Some(Ordering::Greater),
        Operator::GreaterThanOrEqual => {
            matches!(compare(field, value), Some(Ordering::Greater | Ordering::Equal))
        }
        Operator::LessThan => compare(field, value) == Some(Ordering::Less),
        Operator::LessThanOrEqual => {
            matches!(compare(field, value), Some(Ordering::Less | Ordering::Equal))
        }
        Operator::Contains => contains(field, value),
        Operator::NotContains => !contains(field, value),
        Operator::StartsWith => value_to_string(field).starts_with(&value_to_string(value)),
        Operator::EndsWith => value_to_string(field).ends_with(&value_to_string(value)),
        Operator::In => is_in(field, value),
        Operator::NotIn => !is_in(field, value),
        Operator::Exists => !field.is_null(),
        Operator::NotExists => field.is_null(),
        Operator::IsEmpty => is_empty(field),
        Operator::IsNotEmpty => !is_empty(field),
        Operator::Regex => {
            let pattern = value_to_string(value);
            let re = RegexBuilder::new(&pattern)
                .case_insensitive(true)
                .build()
                .map_err(|e| ConditionError::InvalidRegex(e.to_string()))?;
            re.is_match(&value_to_string(field))
        }
    };

    Ok(result)
}
