//! Registry of trigger kinds

use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Trigger errors
#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("Unknown trigger type: {0}")]
    UnknownTriggerType(String),

    #[error("Invalid trigger configuration for {trigger_type}: {reason}")]
    InvalidConfig {
        trigger_type: String,
        reason: String,
    },
}

/// Result type for trigger operations
pub type TriggerResult<T> = Result<T, TriggerError>;

/// An external event offered to trigger matching
#[derive(Debug, Clone)]
pub struct TriggerEvent {
    /// Event type, e.g. "email_received"
    pub event_type: String,

    /// Event payload
    pub data: Value,
}

impl TriggerEvent {
    /// Create a new trigger event
    pub fn new(event_type: impl Into<String>, data: Value) -> Self {
        Self {
            event_type: event_type.into(),
            data,
        }
    }
}

/// One trigger kind: a validator plus a pure matcher
pub trait TriggerDefinition: Send + Sync {
    /// The type string recipes reference this kind by
    fn trigger_type(&self) -> &'static str;

    /// Cheap structural validation of a trigger config
    fn validate_config(&self, config: &Value) -> TriggerResult<()>;

    /// Pure match decision for an incoming event
    ///
    /// Implementations must not have side effects; events of a different
    /// type never match.
    fn matches(&self, config: &Value, event: &TriggerEvent) -> bool;
}

/// Catalog of trigger kinds keyed by type string
pub struct TriggerRegistry {
    definitions: DashMap<String, Arc<dyn TriggerDefinition>>,
}

impl TriggerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            definitions: DashMap::new(),
        }
    }

    /// Register a trigger kind
    pub fn register(&self, definition: Arc<dyn TriggerDefinition>) {
        let trigger_type = definition.trigger_type().to_string();
        debug!(trigger_type = %trigger_type, "Registering trigger kind");
        self.definitions.insert(trigger_type, definition);
    }

    /// Check whether a trigger type is registered
    pub fn is_valid_trigger(&self, trigger_type: &str) -> bool {
        self.definitions.contains_key(trigger_type)
    }

    /// Validate a trigger config against its kind's validator
    pub fn validate_trigger_config(&self, trigger_type: &str, config: &Value) -> TriggerResult<()> {
        let definition = self.definitions.get(trigger_type).ok_or_else(|| {
            warn!(trigger_type = %trigger_type, "Unknown trigger type");
            TriggerError::UnknownTriggerType(trigger_type.to_string())
        })?;
        definition.validate_config(config)
    }

    /// Decide whether an event matches a trigger of the given type/config
    pub fn matches(
        &self,
        trigger_type: &str,
        config: &Value,
        event: &TriggerEvent,
    ) -> TriggerResult<bool> {
        let definition = self
            .definitions
            .get(trigger_type)
            .ok_or_else(|| TriggerError::UnknownTriggerType(trigger_type.to_string()))?;

        if event.event_type != trigger_type {
            return Ok(false);
        }
        Ok(definition.matches(config, event))
    }

    /// Number of registered trigger kinds
    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    /// True when no kinds are registered
    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

impl Default for TriggerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct AlwaysMatch;

    impl TriggerDefinition for AlwaysMatch {
        fn trigger_type(&self) -> &'static str {
            "always"
        }

        fn validate_config(&self, _config: &Value) -> TriggerResult<()> {
            Ok(())
        }

        fn matches(&self, _config: &Value, _event: &TriggerEvent) -> bool {
            true
        }
    }

    #[test]
    fn test_register_and_match() {
        let registry = TriggerRegistry::new();
        registry.register(Arc::new(AlwaysMatch));

        assert!(registry.is_valid_trigger("always"));
        assert!(!registry.is_valid_trigger("never"));

        let event = TriggerEvent::new("always", json!({}));
        assert!(registry.matches("always", &json!({}), &event).unwrap());
    }

    #[test]
    fn test_event_type_mismatch_never_matches() {
        let registry = TriggerRegistry::new();
        registry.register(Arc::new(AlwaysMatch));

        let event = TriggerEvent::new("other", json!({}));
        assert!(!registry.matches("always", &json!({}), &event).unwrap());
    }

    #[test]
    fn test_unknown_type_fails() {
        let registry = TriggerRegistry::new();
        let event = TriggerEvent::new("ghost", json!({}));

        assert!(matches!(
            registry.matches("ghost", &json!({}), &event),
            Err(TriggerError::UnknownTriggerType(_))
        ));
        assert!(matches!(
            registry.validate_trigger_config("ghost", &json!({})),
            Err(TriggerError::UnknownTriggerType(_))
        ));
    }
}
