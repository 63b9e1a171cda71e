//! Conditional logic engine
//!
//! A state-free evaluator for condition trees: leaves compare a resolved
//! field against a value with one of the supported operators, groups combine
//! child conditions with AND/OR logic. Field resolution understands
//! `$scope.path` variable references, registered function calls, and dotted
//! paths into the event data.

mod condition;
mod eval;
mod functions;

pub use condition::{Condition, ConditionError, ConditionGroup, ConditionLeaf, ConditionResult, Logic, Operator};
pub use eval::ConditionEvaluator;
pub use functions::{ConditionFn, FunctionRegistry};
