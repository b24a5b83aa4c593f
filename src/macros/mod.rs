//! G-code macros: named templates expanded into further G-code at run time.

mod registry;
mod template;

pub use registry::MacroRegistry;
pub use template::{HandlebarsEngine, TemplateEngine};

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::{MacroConfig, default_description};
use crate::error::GCodeError;
use crate::gcode::{Command, is_classic_name};

pub type Variables = BTreeMap<String, Value>;

/// How [`crate::dispatch::Dispatcher::reload_macros`] treats variables of macros that already exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VariableMode {
    /// Keep the running values and ignore the configuration.
    #[default]
    Skip,
    /// Add new variables from the configuration, keep running values of existing ones.
    Merge,
    /// Reset every variable to its configured value.
    Replace,
}

#[derive(Debug, Clone)]
pub struct MacroDefinition {
    alias: String,
    template: String,
    template_hash: String,
    variables: Arc<Variables>,
    rename_existing: Option<String>,
    description: String,
}

impl MacroDefinition {
    pub fn new(name: &str, template: &str) -> Result<Self, GCodeError> {
        let alias = name.trim().to_uppercase();
        if alias.is_empty() || alias.contains(char::is_whitespace) {
            return Err(GCodeError::Config(format!("invalid macro name '{}'", name)));
        }
        Ok(Self {
            alias,
            template: template.to_string(),
            template_hash: template_hash(template),
            variables: Arc::new(Variables::new()),
            rename_existing: None,
            description: default_description(),
        })
    }

    pub fn from_config(name: &str, config: &MacroConfig) -> Result<Self, GCodeError> {
        let mut definition = Self::new(name, &config.gcode)?
            .with_description(&config.description)
            .with_variables(config.variables.clone());
        if let Some(rename) = &config.rename_existing {
            definition = definition.with_rename_existing(rename)?;
        }
        Ok(definition)
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn with_template(mut self, template: &str) -> Self {
        self.template = template.to_string();
        self.template_hash = template_hash(template);
        self
    }

    pub fn with_variables(mut self, variables: Variables) -> Self {
        self.variables = Arc::new(variables);
        self
    }

    /// Take over an existing command, keeping the old one reachable under `rename`.
    /// Both names must belong to the same syntax class.
    pub fn with_rename_existing(mut self, rename: &str) -> Result<Self, GCodeError> {
        let rename = rename.trim().to_uppercase();
        if is_classic_name(&self.alias) != is_classic_name(&rename) {
            return Err(GCodeError::Config(format!(
                "G-Code macro rename of different types ('{}' vs '{}')",
                self.alias, rename
            )));
        }
        self.rename_existing = Some(rename);
        Ok(self)
    }

    /// Uppercased name the macro is invoked by.
    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn template_hash(&self) -> &str {
        &self.template_hash
    }

    pub fn variables(&self) -> &Variables {
        &self.variables
    }

    pub fn rename_existing(&self) -> Option<&str> {
        self.rename_existing.as_deref()
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Copy of this definition with one existing variable replaced. Expansions
    /// already rendered keep the values they were rendered with.
    pub fn with_variable(&self, name: &str, value: Value) -> Result<Self, GCodeError> {
        if !self.variables.contains_key(name) {
            return Err(GCodeError::command(format!(
                "Unknown gcode_macro variable '{}'",
                name
            )));
        }
        let mut variables = (*self.variables).clone();
        variables.insert(name.to_string(), value);
        Ok(Self {
            variables: Arc::new(variables),
            ..self.clone()
        })
    }

    /// Template context: every variable by name, plus `params` and `rawparams`.
    pub fn render_context(&self, command: &Command) -> Value {
        let mut context: Map<String, Value> = self
            .variables
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let params: Map<String, Value> = command
            .params()
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        context.insert("params".to_string(), Value::Object(params));
        context.insert(
            "rawparams".to_string(),
            Value::String(command.raw_params().to_string()),
        );
        Value::Object(context)
    }
}

pub fn template_hash(template: &str) -> String {
    format!("{:x}", Sha256::digest(template.as_bytes()))
}

/// Parse a variable value supplied on the command line.
///
/// Accepts JSON literals plus the spellings `True`, `False`, `None` and
/// single quoted strings.
pub fn parse_literal(text: &str) -> Result<Value, GCodeError> {
    let text = text.trim();
    match text {
        "True" => return Ok(Value::Bool(true)),
        "False" => return Ok(Value::Bool(false)),
        "None" => return Ok(Value::Null),
        _ => {}
    }
    if text.len() >= 2 && text.starts_with('\'') && text.ends_with('\'') {
        return Ok(Value::String(text[1..text.len() - 1].to_string()));
    }
    serde_json::from_str(text).map_err(|e| {
        GCodeError::command(format!("Unable to parse '{}' as a literal: {}", text, e))
    })
}
