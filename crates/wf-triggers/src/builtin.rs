//! Built-in trigger kinds
//!
//! Validators perform cheap structural checks; matchers are pure functions
//! over the event data and the trigger's config filters. Empty filters
//! match everything of the right event type.

use chrono::{DateTime, Utc};
use cron::Schedule;
use serde_json::Value;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use crate::registry::{TriggerDefinition, TriggerError, TriggerEvent, TriggerRegistry, TriggerResult};

fn invalid(trigger_type: &str, reason: impl Into<String>) -> TriggerError {
    TriggerError::InvalidConfig {
        trigger_type: trigger_type.to_string(),
        reason: reason.into(),
    }
}

/// Validate that a config key, if present, is an array of strings
fn check_string_array(trigger_type: &str, config: &Value, key: &str) -> TriggerResult<()> {
    match config.get(key) {
        None | Some(Value::Null) => Ok(()),
        Some(Value::Array(items)) => {
            if items.iter().all(|item| item.is_string()) {
                Ok(())
            } else {
                Err(invalid(trigger_type, format!("{} must contain only strings", key)))
            }
        }
        Some(_) => Err(invalid(trigger_type, format!("{} must be an array", key))),
    }
}

/// Read a config key as a list of strings (empty when absent)
fn string_list(config: &Value, key: &str) -> Vec<String> {
    config
        .get(key)
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

fn contains_ci(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

/// Allow-list check: empty list allows everything
fn allowed(list: &[String], value: Option<&str>) -> bool {
    if list.is_empty() {
        return true;
    }
    match value {
        Some(v) => list.iter().any(|entry| entry.eq_ignore_ascii_case(v)),
        None => false,
    }
}

/// Accept standard 5-field cron expressions by prepending a seconds field
fn parse_cron(expression: &str) -> Result<Schedule, String> {
    let normalized = if expression.split_whitespace().count() == 5 {
        format!("0 {}", expression)
    } else {
        expression.to_string()
    };
    Schedule::from_str(&normalized).map_err(|e| e.to_string())
}

/// New email landed in a watched folder
struct EmailReceivedTrigger;

impl TriggerDefinition for EmailReceivedTrigger {
    fn trigger_type(&self) -> &'static str {
        "email_received"
    }

    fn validate_config(&self, config: &Value) -> TriggerResult<()> {
        check_string_array(self.trigger_type(), config, "from_addresses")?;
        check_string_array(self.trigger_type(), config, "subject_keywords")?;
        check_string_array(self.trigger_type(), config, "folders")?;
        Ok(())
    }

    fn matches(&self, config: &Value, event: &TriggerEvent) -> bool {
        let from = event.data.get("from").and_then(|v| v.as_str());
        if !allowed(&string_list(config, "from_addresses"), from) {
            return false;
        }

        if !allowed(&string_list(config, "folders"), event.data.get("folder").and_then(|v| v.as_str())) {
            return false;
        }

        let keywords = string_list(config, "subject_keywords");
        if keywords.is_empty() {
            return true;
        }
        let subject = event.data.get("subject").and_then(|v| v.as_str()).unwrap_or("");
        keywords.iter().any(|k| contains_ci(subject, k))
    }
}

/// Chat message arrived in a watched channel
struct MessageReceivedTrigger;

impl TriggerDefinition for MessageReceivedTrigger {
    fn trigger_type(&self) -> &'static str {
        "message_received"
    }

    fn validate_config(&self, config: &Value) -> TriggerResult<()> {
        check_string_array(self.trigger_type(), config, "channels")?;
        check_string_array(self.trigger_type(), config, "keywords")?;
        Ok(())
    }

    fn matches(&self, config: &Value, event: &TriggerEvent) -> bool {
        let channel = event.data.get("channel").and_then(|v| v.as_str());
        if !allowed(&string_list(config, "channels"), channel) {
            return false;
        }

        let keywords = string_list(config, "keywords");
        if keywords.is_empty() {
            return true;
        }
        let text = event.data.get("text").and_then(|v| v.as_str()).unwrap_or("");
        keywords.iter().any(|k| contains_ci(text, k))
    }
}

/// Calendar event starts within the configured lead time
struct CalendarEventStartingSoonTrigger;

impl TriggerDefinition for CalendarEventStartingSoonTrigger {
    fn trigger_type(&self) -> &'static str {
        "calendar_event_starting_soon"
    }

    fn validate_config(&self, config: &Value) -> TriggerResult<()> {
        check_string_array(self.trigger_type(), config, "calendars")?;
        match config.get("lead_time_minutes") {
            None | Some(Value::Null) => Ok(()),
            Some(v) => match v.as_i64() {
                Some(n) if n > 0 => Ok(()),
                _ => Err(invalid(
                    self.trigger_type(),
                    "lead_time_minutes must be a positive integer",
                )),
            },
        }
    }

    fn matches(&self, config: &Value, event: &TriggerEvent) -> bool {
        let calendar = event.data.get("calendar").and_then(|v| v.as_str());
        if !allowed(&string_list(config, "calendars"), calendar) {
            return false;
        }

        let lead_minutes = config
            .get("lead_time_minutes")
            .and_then(|v| v.as_i64())
            .unwrap_or(15);

        let Some(starts_at) = event
            .data
            .get("starts_at")
            .and_then(|v| v.as_str())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        else {
            return false;
        };

        let until_start = starts_at.with_timezone(&Utc) - Utc::now();
        until_start >= chrono::Duration::zero()
            && until_start <= chrono::Duration::minutes(lead_minutes)
    }
}

/// File appeared under a watched directory
struct FileCreatedTrigger;

impl TriggerDefinition for FileCreatedTrigger {
    fn trigger_type(&self) -> &'static str {
        "file_created"
    }

    fn validate_config(&self, config: &Value) -> TriggerResult<()> {
        check_string_array(self.trigger_type(), config, "extensions")?;

        let paths = string_list(config, "paths");
        match config.get("paths") {
            None | Some(Value::Null) => {
                return Err(invalid(self.trigger_type(), "paths is required"))
            }
            Some(Value::Array(_)) => {}
            Some(_) => return Err(invalid(self.trigger_type(), "paths must be an array")),
        }
        if paths.is_empty() {
            return Err(invalid(self.trigger_type(), "paths must not be empty"));
        }
        for path in &paths {
            if !Path::new(path).is_dir() {
                return Err(invalid(
                    self.trigger_type(),
                    format!("watched path is not a directory: {}", path),
                ));
            }
        }
        Ok(())
    }

    fn matches(&self, config: &Value, event: &TriggerEvent) -> bool {
        let Some(file_path) = event.data.get("path").and_then(|v| v.as_str()) else {
            return false;
        };

        let paths = string_list(config, "paths");
        if !paths.iter().any(|watched| file_path.starts_with(watched.as_str())) {
            return false;
        }

        let extensions = string_list(config, "extensions");
        if extensions.is_empty() {
            return true;
        }
        let ext = Path::new(file_path)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("");
        extensions
            .iter()
            .any(|allowed_ext| allowed_ext.trim_start_matches('.').eq_ignore_ascii_case(ext))
    }
}

/// Task was completed in a watched project
struct TaskCompletedTrigger;

impl TriggerDefinition for TaskCompletedTrigger {
    fn trigger_type(&self) -> &'static str {
        "task_completed"
    }

    fn validate_config(&self, config: &Value) -> TriggerResult<()> {
        check_string_array(self.trigger_type(), config, "projects")?;
        check_string_array(self.trigger_type(), config, "tags")?;
        Ok(())
    }

    fn matches(&self, config: &Value, event: &TriggerEvent) -> bool {
        let project = event.data.get("project").and_then(|v| v.as_str());
        if !allowed(&string_list(config, "projects"), project) {
            return false;
        }

        let wanted_tags = string_list(config, "tags");
        if wanted_tags.is_empty() {
            return true;
        }
        let task_tags: Vec<&str> = event
            .data
            .get("tags")
            .and_then(|v| v.as_array())
            .map(|items| items.iter().filter_map(|t| t.as_str()).collect())
            .unwrap_or_default();
        wanted_tags
            .iter()
            .any(|wanted| task_tags.iter().any(|t| t.eq_ignore_ascii_case(wanted)))
    }
}

/// Time-based trigger: recurring cron expression or a single future instant
///
/// The cron job manager owns the actual scheduling; this kind validates the
/// schedule config and matches the `schedule` events the engine synthesizes
/// when a job fires.
struct ScheduleTrigger;

impl TriggerDefinition for ScheduleTrigger {
    fn trigger_type(&self) -> &'static str {
        "schedule"
    }

    fn validate_config(&self, config: &Value) -> TriggerResult<()> {
        let cron_expr = config.get("cron").and_then(|v| v.as_str());
        let at = config.get("at").and_then(|v| v.as_str());

        match (cron_expr, at) {
            (None, None) => Err(invalid(self.trigger_type(), "either cron or at is required")),
            (Some(_), Some(_)) => {
                Err(invalid(self.trigger_type(), "cron and at are mutually exclusive"))
            }
            (Some(expr), None) => {
                parse_cron(expr)
                    .map_err(|e| invalid(self.trigger_type(), format!("invalid cron expression: {}", e)))?;
                if let Some(tz) = config.get("timezone").and_then(|v| v.as_str()) {
                    tz.parse::<chrono_tz::Tz>()
                        .map_err(|_| invalid(self.trigger_type(), format!("invalid timezone: {}", tz)))?;
                }
                Ok(())
            }
            (None, Some(instant)) => {
                let parsed = DateTime::parse_from_rfc3339(instant)
                    .map_err(|e| invalid(self.trigger_type(), format!("invalid timestamp: {}", e)))?;
                if parsed.with_timezone(&Utc) <= Utc::now() {
                    return Err(invalid(self.trigger_type(), "at must be future-dated"));
                }
                Ok(())
            }
        }
    }

    fn matches(&self, _config: &Value, event: &TriggerEvent) -> bool {
        // Jobs are bound to a recipe; any schedule event offered to this
        // recipe's trigger came from its own job.
        event.data.get("job_id").is_some()
    }
}

/// Inbound webhook call
struct WebhookTrigger;

impl TriggerDefinition for WebhookTrigger {
    fn trigger_type(&self) -> &'static str {
        "webhook"
    }

    fn validate_config(&self, config: &Value) -> TriggerResult<()> {
        match config.get("webhook_id").and_then(|v| v.as_str()) {
            Some(id) if !id.trim().is_empty() => Ok(()),
            _ => Err(invalid(self.trigger_type(), "webhook_id is required")),
        }
    }

    fn matches(&self, config: &Value, event: &TriggerEvent) -> bool {
        let configured = config.get("webhook_id").and_then(|v| v.as_str());
        let received = event.data.get("webhook_id").and_then(|v| v.as_str());
        matches!((configured, received), (Some(c), Some(r)) if c == r)
    }
}

/// Explicit user-initiated run
struct ManualTrigger;

impl TriggerDefinition for ManualTrigger {
    fn trigger_type(&self) -> &'static str {
        "manual"
    }

    fn validate_config(&self, _config: &Value) -> TriggerResult<()> {
        Ok(())
    }

    fn matches(&self, _config: &Value, _event: &TriggerEvent) -> bool {
        true
    }
}

/// Register all built-in trigger kinds
pub fn register_builtin_triggers(registry: &TriggerRegistry) {
    registry.register(Arc::new(EmailReceivedTrigger));
    registry.register(Arc::new(MessageReceivedTrigger));
    registry.register(Arc::new(CalendarEventStartingSoonTrigger));
    registry.register(Arc::new(FileCreatedTrigger));
    registry.register(Arc::new(TaskCompletedTrigger));
    registry.register(Arc::new(ScheduleTrigger));
    registry.register(Arc::new(WebhookTrigger));
    registry.register(Arc::new(ManualTrigger));
}
