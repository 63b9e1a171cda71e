//! Trigger registry
//!
//! A catalog of trigger kinds keyed by type string. Each kind supplies a
//! config validator (cheap structural checks) and a pure matcher that
//! inspects an incoming event's type and data against the trigger's config
//! filters. Scheduling side effects live in the cron job manager; this
//! crate only validates and matches.

mod builtin;
mod registry;

pub use builtin::register_builtin_triggers;
pub use registry::{TriggerDefinition, TriggerError, TriggerEvent, TriggerRegistry, TriggerResult};
