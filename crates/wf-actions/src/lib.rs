//! Action registry
//!
//! A catalog of action executors keyed by type string. Executors receive
//! a fully-resolved config (variable references already substituted by the
//! engine) plus an [`ActionContext`] describing the run they belong to,
//! and return a JSON result that the engine merges back into step scope.

mod builtin;
mod registry;

pub use builtin::{register_builtin_actions, NotificationSink, TracingSink};
pub use registry::{
    ActionContext, ActionError, ActionExecutor, ActionRegistry, ActionResult, SharedActionRegistry,
};
