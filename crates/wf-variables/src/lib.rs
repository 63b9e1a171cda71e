//! Variable resolution for action configs and templates
//!
//! Walks arbitrary value trees and resolves `$scope.path` references (with
//! optional `|transform:arg` chains) and `{{expression}}` templates against
//! a scoped variable context. Missing references degrade to the literal
//! reference text unless the resolver is configured to fail hard.

mod resolver;
mod transforms;

pub use resolver::{ResolverOptions, VariableError, VariableResolver, VariableResult};
pub use transforms::{TransformFn, TransformRegistry};
