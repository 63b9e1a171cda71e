//! Registry of pure functions callable from condition fields and templates
//!
//! Functions are keyed by name and receive already-resolved argument values.

use chrono::Utc;
use dashmap::DashMap;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::condition::{ConditionError, ConditionResult};

/// A registered condition function
pub type ConditionFn = Arc<dyn Fn(&[Value]) -> ConditionResult<Value> + Send + Sync>;

fn invalid_args(name: &str, reason: &str) -> ConditionError {
    ConditionError::InvalidArguments {
        name: name.to_string(),
        reason: reason.to_string(),
    }
}

fn one_arg<'a>(name: &str, args: &'a [Value]) -> ConditionResult<&'a Value> {
    match args {
        [value] => Ok(value),
        _ => Err(invalid_args(name, "expected exactly one argument")),
    }
}

fn as_number(name: &str, value: &Value) -> ConditionResult<f64> {
    value
        .as_f64()
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
        .ok_or_else(|| invalid_args(name, "expected a numeric argument"))
}

/// String-keyed catalog of pure functions
pub struct FunctionRegistry {
    functions: DashMap<String, ConditionFn>,
}

impl FunctionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            functions: DashMap::new(),
        }
    }

    /// Create a registry populated with the built-in functions
    pub fn with_defaults() -> Self {
        let registry = Self::new();

        registry.register("now", |_args| Ok(json!(Utc::now().to_rfc3339())));
        registry.register("today", |_args| {
            Ok(json!(Utc::now().date_naive().to_string()))
        });
        registry.register("len", |args| {
            let value = one_arg("len", args)?;
            let len = match value {
                Value::String(s) => s.chars().count(),
                Value::Array(a) => a.len(),
                Value::Object(o) => o.len(),
                Value::Null => 0,
                _ => return Err(invalid_args("len", "expected string, array, or object")),
            };
            Ok(json!(len))
        });
        registry.register("lower", |args| {
            let value = one_arg("lower", args)?;
            match value.as_str() {
                Some(s) => Ok(json!(s.to_lowercase())),
                None => Err(invalid_args("lower", "expected a string")),
            }
        });
        registry.register("upper", |args| {
            let value = one_arg("upper", args)?;
            match value.as_str() {
                Some(s) => Ok(json!(s.to_uppercase())),
                None => Err(invalid_args("upper", "expected a string")),
            }
        });
        registry.register("trim", |args| {
            let value = one_arg("trim", args)?;
            match value.as_str() {
                Some(s) => Ok(json!(s.trim())),
                None => Err(invalid_args("trim", "expected a string")),
            }
        });
        registry.register("abs", |args| {
            let n = as_number("abs", one_arg("abs", args)?)?;
            Ok(json!(n.abs()))
        });
        registry.register("min", |args| {
            if args.is_empty() {
                return Err(invalid_args("min", "expected at least one argument"));
            }
            let mut best = f64::INFINITY;
            for arg in args {
                best = best.min(as_number("min", arg)?);
            }
            Ok(json!(best))
        });
        registry.register("max", |args| {
            if args.is_empty() {
                return Err(invalid_args("max", "expected at least one argument"));
            }
            let mut best = f64::NEG_INFINITY;
            for arg in args {
                best = best.max(as_number("max", arg)?);
            }
            Ok(json!(best))
        });

        registry
    }

    /// Register a function under a name
    pub fn register<F>(&self, name: impl Into<String>, function: F)
    where
        F: Fn(&[Value]) -> ConditionResult<Value> + Send + Sync + 'static,
    {
        self.functions.insert(name.into(), Arc::new(function));
    }

    /// Check whether a function is registered
    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    /// Call a function by name
    pub fn call(&self, name: &str, args: &[Value]) -> ConditionResult<Value> {
        let function = self
            .functions
            .get(name)
            .ok_or_else(|| ConditionError::UnknownFunction(name.to_string()))?;
        function(args)
    }
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
