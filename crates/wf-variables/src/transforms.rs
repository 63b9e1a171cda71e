//! Transform registry for `$ref|transform:arg` chains
//!
//! Every transform is a pure function from a value (plus optional string
//! arguments) to a value.

use base64::Engine;
use dashmap::DashMap;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::resolver::{VariableError, VariableResult};

/// A registered transform
pub type TransformFn = Arc<dyn Fn(&Value, &[String]) -> VariableResult<Value> + Send + Sync>;

fn bad_input(name: &str, reason: &str) -> VariableError {
    VariableError::Transform {
        name: name.to_string(),
        reason: reason.to_string(),
    }
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn numeric(name: &str, value: &Value) -> VariableResult<f64> {
    match value {
        Value::Number(n) => n.as_f64().ok_or_else(|| bad_input(name, "non-finite number")),
        Value::String(s) => s
            .trim()
            .parse()
            .map_err(|_| bad_input(name, "not a number")),
        _ => Err(bad_input(name, "expected a number")),
    }
}

fn number_value(name: &str, n: f64) -> VariableResult<Value> {
    serde_json::Number::from_f64(n)
        .map(Value::Number)
        .ok_or_else(|| bad_input(name, "result is not a finite number"))
}

/// String-keyed catalog of pure transforms
pub struct TransformRegistry {
    transforms: DashMap<String, TransformFn>,
}

impl TransformRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            transforms: DashMap::new(),
        }
    }

    /// Create a registry populated with the built-in transforms
    pub fn with_defaults() -> Self {
        let registry = Self::new();

        registry.register("upper", |value, _| Ok(json!(stringify(value).to_uppercase())));
        registry.register("lower", |value, _| Ok(json!(stringify(value).to_lowercase())));
        registry.register("trim", |value, _| Ok(json!(stringify(value).trim())));
        registry.register("truncate", |value, args| {
            let limit: usize = args
                .first()
                .and_then(|a| a.parse().ok())
                .ok_or_else(|| bad_input("truncate", "expected a length argument"))?;
            Ok(json!(stringify(value).chars().take(limit).collect::<String>()))
        });
        registry.register("number", |value, _| {
            number_value("number", numeric("number", value)?)
        });
        registry.register("round", |value, args| {
            let digits: u32 = args.first().and_then(|a| a.parse().ok()).unwrap_or(0);
            let factor = 10f64.powi(digits as i32);
            let n = (numeric("round", value)? * factor).round() / factor;
            number_value("round", n)
        });
        registry.register("abs", |value, _| {
            number_value("abs", numeric("abs", value)?.abs())
        });
        registry.register("join", |value, args| {
            let separator = args.first().map(String::as_str).unwrap_or(",");
            match value {
                Value::Array(items) => Ok(json!(items
                    .iter()
                    .map(stringify)
                    .collect::<Vec<_>>()
                    .join(separator))),
                _ => Err(bad_input("join", "expected an array")),
            }
        });
        registry.register("first", |value, _| match value {
            Value::Array(items) => Ok(items.first().cloned().unwrap_or(Value::Null)),
            Value::String(s) => Ok(json!(s.chars().take(1).collect::<String>())),
            _ => Err(bad_input("first", "expected an array or string")),
        });
        registry.register("last", |value, _| match value {
            Value::Array(items) => Ok(items.last().cloned().unwrap_or(Value::Null)),
            Value::String(s) => Ok(json!(s
                .chars()
                .last()
                .map(String::from)
                .unwrap_or_default())),
            _ => Err(bad_input("last", "expected an array or string")),
        });
        registry.register("json", |value, _| {
            serde_json::to_string(value)
                .map(Value::String)
                .map_err(|e| bad_input("json", &e.to_string()))
        });
        registry.register("base64", |value, _| {
            Ok(json!(base64::engine::general_purpose::STANDARD
                .encode(stringify(value).as_bytes())))
        });
        registry.register("default", |value, args| {
            let fallback = args.first().cloned().unwrap_or_default();
            if value.is_null() || matches!(value, Value::String(s) if s.is_empty()) {
                Ok(json!(fallback))
            } else {
                Ok(value.clone())
            }
        });

        registry
    }

    /// Register a transform under a name
    pub fn register<F>(&self, name: impl Into<String>, transform: F)
    where
        F: Fn(&Value, &[String]) -> VariableResult<Value> + Send + Sync + 'static,
    {
        self.transforms.insert(name.into(), Arc::new(transform));
    }

    /// Check whether a transform is registered
    pub fn contains(&self, name: &str) -> bool {
        self.transforms.contains_key(name)
    }

    /// Apply a transform by name
    pub fn apply(&self, name: &str, value: &Value, args: &[String]) -> VariableResult<Value> {
        let transform = self
            .transforms
            .get(name)
            .ok_or_else(|| VariableError::UnknownTransform(name.to_string()))?;
        transform(value, args)
    }
}

impl Default for TransformRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
