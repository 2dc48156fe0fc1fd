//! Recipe-to-Custom-App mapping table.
//!
//! An optional JSON file associating recipe keys with tenant names and Self
//! Service categories, consulted before any name matching. Keys match by
//! substring against the recipe name so `Firefox` covers
//! `Firefox.pkg.recipe` and local overrides alike.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Name and category associations for one recipe key.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MappingRule {
    #[serde(default)]
    pub prod_name: Option<String>,
    #[serde(default)]
    pub test_name: Option<String>,
    #[serde(default)]
    pub ss_category: Option<String>,
    #[serde(default)]
    pub test_category: Option<String>,
}

/// The full recipe map, ordered so lookups are deterministic when several
/// keys match the same recipe.
#[derive(Debug, Clone, Default)]
pub struct RecipeMap {
    rules: BTreeMap<String, MappingRule>,
}

impl RecipeMap {
    /// Load a recipe map from disk. A missing file is an empty map; a
    /// present-but-invalid file is an error, since an admin clearly meant
    /// to configure something.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::debug!("No recipe map at {}", path.display());
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("Could not read recipe map: {}", path.display()))?;
        let rules: BTreeMap<String, MappingRule> = serde_json::from_str(&content)
            .with_context(|| format!("Invalid JSON in recipe map: {}", path.display()))?;
        Ok(Self { rules })
    }

    #[cfg(test)]
    fn from_rules(rules: BTreeMap<String, MappingRule>) -> Self {
        Self { rules }
    }

    /// Find the first rule whose key appears within the recipe name.
    pub fn lookup(&self, recipe_name: &str) -> Option<&MappingRule> {
        self.rules
            .iter()
            .find(|(key, _)| recipe_name.contains(key.as_str()))
            .map(|(_, rule)| rule)
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
