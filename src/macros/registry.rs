use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::MacroDefinition;
use crate::error::GCodeError;

/// Shared, case-insensitive table of macro definitions keyed by alias.
///
/// Definitions are handed out as `Arc`s; updating a variable swaps in a new
/// definition so an expansion in progress keeps the values it started with.
#[derive(Debug, Clone, Default)]
pub struct MacroRegistry {
    macros: Arc<RwLock<HashMap<String, Arc<MacroDefinition>>>>,
}

impl MacroRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a definition. Fails with `DuplicateMacro` if the alias is taken and
    /// `replace` is false.
    pub async fn register(
        &self,
        definition: MacroDefinition,
        replace: bool,
    ) -> Result<Arc<MacroDefinition>, GCodeError> {
        let mut macros = self.macros.write().await;
        let alias = definition.alias().to_string();
        if !replace && macros.contains_key(&alias) {
            return Err(GCodeError::DuplicateMacro(alias));
        }
        let definition = Arc::new(definition);
        macros.insert(alias.clone(), Arc::clone(&definition));
        tracing::info!("Defined macro: {}", alias);
        Ok(definition)
    }

    pub async fn lookup(&self, name: &str) -> Option<Arc<MacroDefinition>> {
        self.macros.read().await.get(&name.to_uppercase()).cloned()
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.macros.read().await.contains_key(&name.to_uppercase())
    }

    pub async fn remove(&self, name: &str) -> Result<Arc<MacroDefinition>, GCodeError> {
        let alias = name.to_uppercase();
        match self.macros.write().await.remove(&alias) {
            Some(definition) => {
                tracing::info!("Removed macro: {}", alias);
                Ok(definition)
            }
            None => Err(GCodeError::Config(format!("Macro '{}' not found", alias))),
        }
    }

    /// Sorted list of aliases.
    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.macros.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn set_variable(
        &self,
        macro_name: &str,
        variable: &str,
        value: Value,
    ) -> Result<(), GCodeError> {
        let alias = macro_name.to_uppercase();
        let mut macros = self.macros.write().await;
        let current = macros
            .get(&alias)
            .ok_or_else(|| GCodeError::command(format!("Unknown gcode_macro '{}'", macro_name)))?;
        let updated = current.with_variable(variable, value)?;
        macros.insert(alias, Arc::new(updated));
        Ok(())
    }
}
