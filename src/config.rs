//! # Loader and Macro Configuration
//!
//! ## Example: TOML Configuration
//!
//! ```toml
//! [loader]
//! path = "~/gcodes"
//! extensions = ["gcode", "g", "gco"]
//! on_error_gcode = "M104 S0"
//!
//! [macros.PRIME_LINE]
//! description = "Draw a purge line"
//! gcode = """
//! G92 E0
//! G1 X{{length}} E{{params.E}}
//! """
//! variables = { length = 100 }
//!
//! [macros.G28]
//! rename_existing = "G28.1"
//! gcode = "G28.1 {{rawparams}}"
//! ```
//!
//! Templates are rendered with handlebars. The context holds every macro
//! variable by name, `params` (the invoking command's named parameters) and
//! `rawparams` (its raw parameter text).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::error::GCodeError;
use crate::file_manager::DEFAULT_EXTENSIONS;
use crate::gcode::is_classic_name;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl From<ConfigError> for GCodeError {
    fn from(err: ConfigError) -> Self {
        GCodeError::Config(err.to_string())
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LoaderConfig {
    #[serde(default)]
    pub loader: LoaderSection,
    #[serde(default)]
    pub macros: BTreeMap<String, MacroConfig>,
}

/// File location and job loop settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoaderSection {
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
    /// Template run after a job aborts on a command error.
    #[serde(default)]
    pub on_error_gcode: Option<String>,
    #[serde(default = "default_busy_backoff_ms")]
    pub busy_backoff_ms: u64,
    #[serde(default = "default_pause_poll_ms")]
    pub pause_poll_ms: u64,
}

impl Default for LoaderSection {
    fn default() -> Self {
        Self {
            path: default_path(),
            extensions: default_extensions(),
            on_error_gcode: None,
            busy_backoff_ms: default_busy_backoff_ms(),
            pause_poll_ms: default_pause_poll_ms(),
        }
    }
}

impl LoaderSection {
    /// Base directory with a leading `~` expanded to `$HOME`.
    pub fn base_dir(&self) -> PathBuf {
        match (self.path.strip_prefix('~'), std::env::var_os("HOME")) {
            (Some(rest), Some(home)) => {
                PathBuf::from(home).join(rest.trim_start_matches(['/', '\\']))
            }
            _ => PathBuf::from(&self.path),
        }
    }

    pub fn busy_backoff(&self) -> Duration {
        Duration::from_millis(self.busy_backoff_ms)
    }

    pub fn pause_poll(&self) -> Duration {
        Duration::from_millis(self.pause_poll_ms)
    }
}

/// One `[macros.NAME]` table.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct MacroConfig {
    pub gcode: String,
    #[serde(default = "default_description")]
    pub description: String,
    #[serde(default)]
    pub rename_existing: Option<String>,
    #[serde(default)]
    pub variables: BTreeMap<String, serde_json::Value>,
}

impl MacroConfig {
    pub fn new(gcode: &str) -> Self {
        Self {
            gcode: gcode.to_string(),
            description: default_description(),
            rename_existing: None,
            variables: BTreeMap::new(),
        }
    }
}

impl LoaderConfig {
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: LoaderConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.loader.extensions.is_empty() {
            return Err(ConfigError::Invalid("loader.extensions must not be empty".into()));
        }
        if self.loader.busy_backoff_ms == 0 {
            return Err(ConfigError::Invalid("loader.busy_backoff_ms must be positive".into()));
        }
        for (name, config) in &self.macros {
            if name.trim().is_empty() || name.contains(char::is_whitespace) {
                return Err(ConfigError::Invalid(format!("invalid macro name '{}'", name)));
            }
            if let Some(rename) = &config.rename_existing {
                if is_classic_name(&name.to_uppercase()) != is_classic_name(&rename.to_uppercase()) {
                    return Err(ConfigError::Invalid(format!(
                        "G-Code macro rename of different types ('{}' vs '{}')",
                        name, rename
                    )));
                }
            }
        }
        Ok(())
    }
}

fn default_path() -> String {
    "~/gcodes".to_string()
}
fn default_extensions() -> Vec<String> {
    DEFAULT_EXTENSIONS.iter().map(|e| e.to_string()).collect()
}
fn default_busy_backoff_ms() -> u64 {
    100
}
fn default_pause_poll_ms() -> u64 {
    1
}
pub(crate) fn default_description() -> String {
    "G-Code macro".to_string()
}

pub fn load_config(path: &str) -> Result<LoaderConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(contents) => match LoaderConfig::from_toml_str(&contents) {
            Ok(config) => Ok(config),
            Err(e) => {
                tracing::error!("Failed to load config '{}': {}", path, e);
                Err(e)
            }
        },
        Err(e) => {
            tracing::error!("Failed to read config file '{}': {}", path, e);
            Err(ConfigError::Io(e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn test_default_values() {
        let config = LoaderConfig::default();
        assert_eq!(config.loader.path, "~/gcodes");
        assert_eq!(config.loader.extensions, vec!["gcode", "g", "gco"]);
        assert_eq!(config.loader.busy_backoff(), Duration::from_millis(100));
        assert_eq!(config.loader.pause_poll(), Duration::from_millis(1));
        assert!(config.macros.is_empty());
    }

    #[test]
    fn test_load_config_success() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("loader.toml");
        let mut file = File::create(&file_path).unwrap();
        writeln!(
            file,
            "[loader]\npath = '/tmp/g'\n\n[macros.PURGE]\ngcode = 'G1 E{{{{amount}}}}'\nvariables = {{ amount = 5 }}"
        )
        .unwrap();
        file.flush().unwrap();
        let config = load_config(file_path.to_str().unwrap()).unwrap();
        assert_eq!(config.loader.base_dir(), PathBuf::from("/tmp/g"));
        let purge = &config.macros["PURGE"];
        assert_eq!(purge.gcode, "G1 E{{amount}}");
        assert_eq!(purge.description, "G-Code macro");
        assert_eq!(purge.variables["amount"], serde_json::json!(5));
    }

    #[test]
    fn test_load_config_missing_file() {
        let result = load_config("nonexistent_file.toml");
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }

    #[test]
    fn test_load_config_invalid_toml() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("bad.toml");
        let mut file = File::create(&file_path).unwrap();
        writeln!(file, "not a valid toml").unwrap();
        file.flush().unwrap();
        let result = load_config(file_path.to_str().unwrap());
        assert!(matches!(result, Err(ConfigError::Toml(_))));
    }

    #[test]
    fn test_rename_across_syntax_classes_rejected() {
        let toml = r#"
        [macros.G28]
        rename_existing = "HOME_BASE"
        gcode = "HOME_BASE"
        "#;
        let err = LoaderConfig::from_toml_str(toml).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let toml = r#"
        [macros.G28]
        rename_existing = "G28.1"
        gcode = "G28.1"
        "#;
        assert!(LoaderConfig::from_toml_str(toml).is_ok());
    }
}
