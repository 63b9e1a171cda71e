//! Recipe file loading

use std::path::Path;
use tracing::info;

use crate::error::EngineResult;
use crate::recipe::RecipeDefinition;

/// Load recipe definitions from a YAML file
///
/// The file holds a list of definitions in the same shape the JSON API
/// accepts. Definitions are not validated here; creation validates.
pub fn load_recipes_from_yaml(path: impl AsRef<Path>) -> EngineResult<Vec<RecipeDefinition>> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)?;
    let definitions: Vec<RecipeDefinition> = serde_yaml::from_str(&raw)?;
    info!(path = %path.display(), count = definitions.len(), "Loaded recipe definitions");
    Ok(definitions)
}
