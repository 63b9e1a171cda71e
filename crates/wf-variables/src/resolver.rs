//! The variable resolver
//!
//! Resolution rules for strings inside a config tree:
//! - `$scope.path|transform:arg|...` — a variable reference with an optional
//!   transform chain, replaced by the resolved (possibly non-string) value.
//! - `{{expression}}` — template interpolation; expressions use the same
//!   reference/function grammar and the result is stringified (null becomes
//!   the empty string, objects become JSON).
//! - anything else is returned unchanged.
//!
//! Missing references degrade to the literal reference text (never a silent
//! empty string) unless `throw_on_missing` is set or a configured default
//! applies. Successful lookups are cached per execution; the cache is keyed
//! by execution id and must be invalidated when the execution finalizes.

use dashmap::DashMap;
use regex::Regex;
use serde_json::Value;
use std::sync::{Arc, OnceLock};
use thiserror::Error;
use tracing::trace;
use wf_conditions::{ConditionError, ConditionEvaluator};
use wf_core::VariableContext;

use crate::transforms::TransformRegistry;

/// Variable resolution errors
#[derive(Debug, Error)]
pub enum VariableError {
    #[error("Variable not found: {0}")]
    VariableNotFound(String),

    #[error("Unknown transform: {0}")]
    UnknownTransform(String),

    #[error("Transform {name} failed: {reason}")]
    Transform { name: String, reason: String },

    #[error(transparent)]
    Condition(#[from] ConditionError),
}

/// Result type for variable resolution
pub type VariableResult<T> = Result<T, VariableError>;

/// Resolver behavior for missing references
#[derive(Debug, Clone, Default)]
pub struct ResolverOptions {
    /// Fail with VariableNotFound instead of degrading
    pub throw_on_missing: bool,

    /// Value substituted for missing references when not throwing
    pub missing_default: Option<Value>,
}

/// Resolves variable references and templates inside value trees
pub struct VariableResolver {
    transforms: TransformRegistry,
    evaluator: Arc<ConditionEvaluator>,
    options: ResolverOptions,
    /// (execution_id, reference) -> resolved value; hits only, misses are
    /// never cached because the step scope grows during an execution
    cache: DashMap<(String, String), Value>,
}

fn template_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\{\{\s*([^{}]+?)\s*\}\}").unwrap())
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Split a reference on top-level pipes, respecting quoted sections
fn split_pipes(raw: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;

    for c in raw.chars() {
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
                '|' => {
                    parts.push(current.trim().to_string());
                    current.clear();
                }
                _ => current.push(c),
            },
        }
    }
    parts.push(current.trim().to_string());
    parts
}

/// Parse one `name:arg` transform step
fn parse_transform(step: &str) -> (String, Vec<String>) {
    match step.split_once(':') {
        Some((name, arg)) => (name.trim().to_string(), vec![arg.trim().to_string()]),
        None => (step.trim().to_string(), Vec::new()),
    }
}

impl VariableResolver {
    /// Create a resolver with default transforms, functions, and options
    pub fn new() -> Self {
        Self {
            transforms: TransformRegistry::with_defaults(),
            evaluator: Arc::new(ConditionEvaluator::new()),
            options: ResolverOptions::default(),
            cache: DashMap::new(),
        }
    }

    /// Use a shared condition evaluator (shared function registry)
    pub fn with_evaluator(mut self, evaluator: Arc<ConditionEvaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    /// Override missing-reference behavior
    pub fn with_options(mut self, options: ResolverOptions) -> Self {
        self.options = options;
        self
    }

    /// The transform registry, for registering custom transforms
    pub fn transforms(&self) -> &TransformRegistry {
        &self.transforms
    }

    /// Resolve every reference and template inside a value tree
    ///
    /// Returns a new tree; values without references are deep-copied
    /// unchanged.
    pub fn resolve(&self, tree: &Value, ctx: &VariableContext) -> VariableResult<Value> {
        match tree {
            Value::String(s) => self.resolve_string(s, ctx),
            Value::Array(items) => {
                let mut resolved = Vec::with_capacity(items.len());
                for item in items {
                    resolved.push(self.resolve(item, ctx)?);
                }
                Ok(Value::Array(resolved))
            }
            Value::Object(map) => {
                let mut resolved = serde_json::Map::with_capacity(map.len());
                for (key, value) in map {
                    resolved.insert(key.clone(), self.resolve(value, ctx)?);
                }
                Ok(Value::Object(resolved))
            }
            other => Ok(other.clone()),
        }
    }

    /// Resolve a single string per the rules above
    pub fn resolve_string(&self, s: &str, ctx: &VariableContext) -> VariableResult<Value> {
        if s.starts_with('$') {
            return self.resolve_reference(s, ctx);
        }
        if s.contains("{{") {
            return Ok(Value::String(self.resolve_template(s, ctx)?));
        }
        Ok(Value::String(s.to_string()))
    }

    /// Drop cached entries for a finished execution
    pub fn invalidate_execution(&self, execution_id: &str) {
        self.cache.retain(|(cached_id, _), _| cached_id != execution_id);
    }

    fn cache_key(&self, ctx: &VariableContext, raw: &str) -> Option<(String, String)> {
        ctx.execution_id()
            .map(|id| (id.to_string(), raw.to_string()))
    }

    /// Resolve a `$reference|chain` string to a value
    fn resolve_reference(&self, raw: &str, ctx: &VariableContext) -> VariableResult<Value> {
        if let Some(key) = self.cache_key(ctx, raw) {
            if let Some(hit) = self.cache.get(&key) {
                trace!(reference = raw, "Variable cache hit");
                return Ok(hit.clone());
            }
        }

        let parts = split_pipes(raw);
        let Some(reference) = parts[0].strip_prefix('$') else {
            return Ok(Value::String(raw.to_string()));
        };
        let chain = &parts[1..];

        // Unknown scopes count as missing, same as absent keys
        let looked_up = ctx.lookup_reference(reference).ok().flatten();
        let found = looked_up.is_some();

        let value = match looked_up {
            Some(value) => value,
            None => {
                let has_default_transform = chain
                    .iter()
                    .any(|step| parse_transform(step).0 == "default");
                if has_default_transform {
                    Value::Null
                } else if self.options.throw_on_missing {
                    return Err(VariableError::VariableNotFound(parts[0].clone()));
                } else if let Some(default) = &self.options.missing_default {
                    return Ok(default.clone());
                } else {
                    // Degrade to the literal reference text to aid debugging
                    return Ok(Value::String(raw.to_string()));
                }
            }
        };

        let mut result = value;
        for step in chain {
            let (name, args) = parse_transform(step);
            result = self.transforms.apply(&name, &result, &args)?;
        }

        // A miss that degraded through `default` must not shadow a value
        // that lands in the step scope later
        if found {
            if let Some(key) = self.cache_key(ctx, raw) {
                self.cache.insert(key, result.clone());
            }
        }

        Ok(result)
    }

    /// Interpolate every `{{expression}}` in a string
    fn resolve_template(&self, s: &str, ctx: &VariableContext) -> VariableResult<String> {
        let mut output = String::with_capacity(s.len());
        let mut last_end = 0;

        for captures in template_pattern().captures_iter(s) {
            let (Some(whole), Some(expr)) = (captures.get(0), captures.get(1)) else {
                continue;
            };
            let expr = expr.as_str();

            output.push_str(&s[last_end..whole.start()]);

            let value = if expr.starts_with('$') {
                self.resolve_reference(expr, ctx)?
            } else {
                let trigger_data = ctx.trigger_data();
                self.evaluator.resolve_expression(expr, &trigger_data, ctx)?
            };
            output.push_str(&stringify(&value));

            last_end = whole.end();
        }

        output.push_str(&s[last_end..]);
        Ok(output)
    }
}

impl Default for VariableResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wf_core::VariableScope;

    fn sample_ctx() -> VariableContext {
        let mut ctx = VariableContext::new();
        ctx.set(VariableScope::Global, "workspace", json!("personal"));
        ctx.set(VariableScope::Execution, "execution_id", json!("exec-1"));
        ctx.set(VariableScope::Execution, "timestamp", json!("2026-08-30T10:00:00Z"));
        ctx.set(
            VariableScope::Execution,
            "trigger",
            json!({"subject": "URGENT: server down", "count": 3}),
        );
        ctx.set_step("action_0_result", json!({"ticket": "OPS-120", "tags": ["a", "b"]}));
        ctx
    }

    #[test]
    fn test_plain_tree_deep_equal_copy() {
        let resolver = VariableResolver::new();
        let tree = json!({
            "numbers": [1, 2, 3],
            "nested": {"text": "no references here", "flag": true}
        });
        assert_eq!(resolver.resolve(&tree, &sample_ctx()).unwrap(), tree);
    }

    #[test]
    fn test_reference_keeps_value_type() {
        let resolver = VariableResolver::new();
        let ctx = sample_ctx();
        assert_eq!(
            resolver.resolve(&json!("$trigger.count"), &ctx).unwrap(),
            json!(3)
        );
        assert_eq!(
            resolver.resolve(&json!("$step.action_0_result"), &ctx).unwrap(),
            json!({"ticket": "OPS-120", "tags": ["a", "b"]})
        );
    }

    #[test]
    fn test_transform_chain() {
        let resolver = VariableResolver::new();
        let ctx = sample_ctx();
        assert_eq!(
            resolver
                .resolve(&json!("$trigger.subject|lower|truncate:6"), &ctx)
                .unwrap(),
            json!("urgent")
        );
        assert_eq!(
            resolver
                .resolve(&json!("$step.action_0_result.tags|join:-"), &ctx)
                .unwrap(),
            json!("a-b")
        );
    }

    #[test]
    fn test_missing_reference_degrades_to_literal() {
        let resolver = VariableResolver::new();
        assert_eq!(
            resolver.resolve(&json!("$step.nothing"), &sample_ctx()).unwrap(),
            json!("$step.nothing")
        );
    }

    #[test]
    fn test_missing_reference_with_default_transform() {
        let resolver = VariableResolver::new();
        assert_eq!(
            resolver
                .resolve(&json!("$step.nothing|default:fallback"), &sample_ctx())
                .unwrap(),
            json!("fallback")
        );
    }

    #[test]
    fn test_throw_on_missing() {
        let resolver = VariableResolver::new().with_options(ResolverOptions {
            throw_on_missing: true,
            missing_default: None,
        });
        assert!(matches!(
            resolver.resolve(&json!("$step.nothing"), &sample_ctx()),
            Err(VariableError::VariableNotFound(_))
        ));
    }

    #[test]
    fn test_configured_missing_default() {
        let resolver = VariableResolver::new().with_options(ResolverOptions {
            throw_on_missing: false,
            missing_default: Some(Value::Null),
        });
        assert_eq!(
            resolver.resolve(&json!("$step.nothing"), &sample_ctx()).unwrap(),
            Value::Null
        );
    }

    #[test]
    fn test_template_interpolation() {
        let resolver = VariableResolver::new();
        let ctx = sample_ctx();
        assert_eq!(
            resolver
                .resolve(&json!("Re: {{$trigger.subject|truncate:6}} ({{count}})"), &ctx)
                .unwrap(),
            json!("Re: URGENT (3)")
        );
    }

    #[test]
    fn test_template_stringifies_objects_and_null() {
        let resolver = VariableResolver::new();
        let ctx = sample_ctx();
        assert_eq!(
            resolver
                .resolve(&json!("result={{$step.action_0_result}}"), &ctx)
                .unwrap(),
            json!(r#"result={"ticket":"OPS-120","tags":["a","b"]}"#)
        );
        // Bare names fall back to trigger data; absent ones stringify empty
        assert_eq!(
            resolver.resolve(&json!("x={{absent}}"), &ctx).unwrap(),
            json!("x=")
        );
    }

    #[test]
    fn test_template_function_call() {
        let resolver = VariableResolver::new();
        assert_eq!(
            resolver
                .resolve(&json!("{{upper(subject)}}"), &sample_ctx())
                .unwrap(),
            json!("URGENT: SERVER DOWN")
        );
    }

    #[test]
    fn test_nested_tree_resolution() {
        let resolver = VariableResolver::new();
        let tree = json!({
            "to": "$trigger.subject|truncate:6",
            "body": ["{{workspace}}", {"ticket": "$step.action_0_result.ticket"}]
        });
        // `workspace` is not in trigger data, so the bare template is empty
        assert_eq!(
            resolver.resolve(&tree, &sample_ctx()).unwrap(),
            json!({
                "to": "URGENT",
                "body": ["", {"ticket": "OPS-120"}]
            })
        );
    }

    #[test]
    fn test_cache_hit_and_invalidation() {
        let resolver = VariableResolver::new();
        let ctx = sample_ctx();

        assert_eq!(
            resolver.resolve(&json!("$trigger.count"), &ctx).unwrap(),
            json!(3)
        );
        assert_eq!(resolver.cache.len(), 1);

        resolver.invalidate_execution("exec-1");
        assert_eq!(resolver.cache.len(), 0);
    }

    #[test]
    fn test_misses_are_not_cached() {
        let resolver = VariableResolver::new();
        let mut ctx = sample_ctx();

        assert_eq!(
            resolver.resolve(&json!("$step.action_1_result"), &ctx).unwrap(),
            json!("$step.action_1_result")
        );
        assert_eq!(resolver.cache.len(), 0);

        // Once the step output lands, the same reference resolves
        ctx.set_step("action_1_result", json!("done"));
        assert_eq!(
            resolver.resolve(&json!("$step.action_1_result"), &ctx).unwrap(),
            json!("done")
        );
    }

    #[test]
    fn test_default_fallback_not_cached() {
        let resolver = VariableResolver::new();
        let mut ctx = sample_ctx();

        assert_eq!(
            resolver.resolve(&json!("$step.out|default:none"), &ctx).unwrap(),
            json!("none")
        );
        assert_eq!(resolver.cache.len(), 0, "default fill-ins are not cached");

        ctx.set_step("out", json!("real"));
        assert_eq!(
            resolver.resolve(&json!("$step.out|default:none"), &ctx).unwrap(),
            json!("real")
        );
    }
}
