//! Command dispatch and the shared context every pipeline stage runs against.
//!
//! The [`Dispatcher`] owns the macro registry, the command table, the
//! template engine and the file manager, plus the dispatch lock that
//! serialises interactive commands against the print job and the response
//! and shutdown broadcast channels.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use tokio::sync::{Mutex, MutexGuard, broadcast};
use tracing::{debug, info, warn};

use crate::config::{LoaderConfig, MacroConfig};
use crate::error::GCodeError;
use crate::expander::MacroExpander;
use crate::file_manager::FileManager;
use crate::gcode::{Command, Line};
use crate::macros::{
    HandlebarsEngine, MacroDefinition, MacroRegistry, TemplateEngine, VariableMode, parse_literal,
};

const CHANNEL_CAPACITY: usize = 256;

/// Handles one command. Errors are tagged with the failing line by the dispatcher.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, dispatcher: &Arc<Dispatcher>, command: &Command) -> Result<(), GCodeError>;
}

#[derive(Clone)]
struct CommandEntry {
    handler: Arc<dyn CommandHandler>,
    description: Option<String>,
}

/// Which macros a reload touched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReloadSummary {
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub removed: Vec<String>,
}

pub struct Dispatcher {
    macros: MacroRegistry,
    commands: RwLock<HashMap<String, CommandEntry>>,
    default_handler: RwLock<Option<Arc<dyn CommandHandler>>>,
    templates: Arc<dyn TemplateEngine>,
    files: Arc<FileManager>,
    mutex: Mutex<()>,
    responses: broadcast::Sender<String>,
    shutdown: broadcast::Sender<String>,
}

impl Dispatcher {
    pub fn new(files: FileManager, templates: Arc<dyn TemplateEngine>) -> Arc<Self> {
        let (responses, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (shutdown, _) = broadcast::channel(16);
        let dispatcher = Arc::new(Self {
            macros: MacroRegistry::new(),
            commands: RwLock::new(HashMap::new()),
            default_handler: RwLock::new(None),
            templates,
            files: Arc::new(files),
            mutex: Mutex::new(()),
            responses,
            shutdown,
        });
        dispatcher.register_command(
            "SET_GCODE_VARIABLE",
            Arc::new(SetVariable),
            Some("Set the value of a G-Code macro variable"),
        );
        dispatcher
    }

    /// Dispatcher with a file manager for `[loader]` and the handlebars engine.
    /// Macros are not loaded here; call [`Dispatcher::load_macro_configs`]
    /// once the commands they may rename are registered.
    pub fn from_config(config: &LoaderConfig) -> Arc<Self> {
        let files = FileManager::new(config.loader.base_dir())
            .with_extensions(&config.loader.extensions);
        Self::new(files, Arc::new(HandlebarsEngine::new()))
    }

    pub fn macros(&self) -> &MacroRegistry {
        &self.macros
    }

    pub fn templates(&self) -> &dyn TemplateEngine {
        self.templates.as_ref()
    }

    pub fn files(&self) -> &FileManager {
        &self.files
    }

    // Command table

    /// Install `handler` for `name`, replacing any previous handler.
    pub fn register_command(
        &self,
        name: &str,
        handler: Arc<dyn CommandHandler>,
        description: Option<&str>,
    ) {
        let entry = CommandEntry {
            handler,
            description: description.map(str::to_string),
        };
        if let Ok(mut commands) = self.commands.write() {
            commands.insert(name.to_uppercase(), entry);
        }
    }

    pub fn unregister_command(&self, name: &str) -> bool {
        self.commands
            .write()
            .map(|mut commands| commands.remove(&name.to_uppercase()).is_some())
            .unwrap_or(false)
    }

    pub fn has_command(&self, name: &str) -> bool {
        self.commands
            .read()
            .map(|commands| commands.contains_key(&name.to_uppercase()))
            .unwrap_or(false)
    }

    /// Sorted command names with their help text.
    pub fn command_help(&self) -> Vec<(String, Option<String>)> {
        let mut help: Vec<_> = self
            .commands
            .read()
            .map(|commands| {
                commands
                    .iter()
                    .map(|(name, entry)| (name.clone(), entry.description.clone()))
                    .collect()
            })
            .unwrap_or_default();
        help.sort();
        help
    }

    /// Handler used for commands with no table entry, typically the motion backend.
    pub fn set_default_handler(&self, handler: Arc<dyn CommandHandler>) {
        if let Ok(mut slot) = self.default_handler.write() {
            *slot = Some(handler);
        }
    }

    fn handler_for(&self, name: &str) -> Option<Arc<dyn CommandHandler>> {
        let from_table = self
            .commands
            .read()
            .ok()
            .and_then(|commands| commands.get(name).map(|e| Arc::clone(&e.handler)));
        from_table.or_else(|| self.default_handler.read().ok().and_then(|h| h.clone()))
    }

    /// Move the handler registered under `old` to `new`. Returns false when
    /// `old` has no handler.
    pub fn rename_command(&self, old: &str, new: &str) -> Result<bool, GCodeError> {
        let old = old.to_uppercase();
        let new = new.to_uppercase();
        let mut commands = self
            .commands
            .write()
            .map_err(|_| GCodeError::Internal("command table poisoned".into()))?;
        if commands.contains_key(&new) {
            return Err(GCodeError::Config(format!(
                "Command '{}' already registered",
                new
            )));
        }
        match commands.remove(&old) {
            Some(entry) => {
                commands.insert(new.clone(), entry);
                debug!("Renamed command {} to {}", old, new);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn fill_description(&self, name: &str, description: String) {
        if let Ok(mut commands) = self.commands.write() {
            if let Some(entry) = commands.get_mut(&name.to_uppercase()) {
                entry.description.get_or_insert(description);
            }
        }
    }

    // Macros

    /// Register a macro, moving an existing command out of the way if it asks to.
    pub async fn load_macro(&self, definition: MacroDefinition) -> Result<(), GCodeError> {
        let alias = definition.alias().to_string();
        let rename = definition.rename_existing().map(str::to_string);
        if rename.is_none() && self.has_command(&alias) {
            // Only rename_existing may take over a registered command.
            return Err(GCodeError::DuplicateMacro(alias));
        }
        self.macros.register(definition, false).await?;
        if let Some(rename) = rename {
            match self.rename_command(&alias, &rename) {
                Ok(true) => {
                    self.fill_description(&rename, format!("Renamed builtin of '{}'", alias))
                }
                Ok(false) => {
                    let _ = self.macros.remove(&alias).await;
                    return Err(GCodeError::Config(format!(
                        "Existing command '{}' not found in gcode_macro rename",
                        alias
                    )));
                }
                Err(e) => {
                    let _ = self.macros.remove(&alias).await;
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Remove a macro and restore any command it renamed.
    pub async fn remove_macro(&self, name: &str) -> Result<(), GCodeError> {
        let definition = self.macros.remove(name).await?;
        if let Some(rename) = definition.rename_existing() {
            self.rename_command(rename, definition.alias())?;
        }
        Ok(())
    }

    pub async fn load_macro_configs(
        &self,
        configs: &BTreeMap<String, MacroConfig>,
    ) -> Result<(), GCodeError> {
        for (name, config) in configs {
            self.load_macro(MacroDefinition::from_config(name, config)?).await?;
        }
        Ok(())
    }

    /// Bring the registry in line with `configs`: new macros are added,
    /// changed ones updated in place and missing ones removed.
    pub async fn reload_macros(
        &self,
        configs: &BTreeMap<String, MacroConfig>,
        mode: VariableMode,
    ) -> Result<ReloadSummary, GCodeError> {
        let mut summary = ReloadSummary::default();
        let mut wanted = Vec::with_capacity(configs.len());
        for (name, config) in configs {
            let fresh = MacroDefinition::from_config(name, config)?;
            wanted.push(fresh.alias().to_string());
            match self.macros.lookup(fresh.alias()).await {
                None => {
                    summary.added.push(fresh.alias().to_string());
                    self.load_macro(fresh).await?;
                }
                Some(current) => {
                    if let Some(updated) = self.merge_definition(&current, fresh, mode)? {
                        summary.updated.push(updated.alias().to_string());
                        self.macros.register(updated, true).await?;
                    }
                }
            }
        }
        for alias in self.macros.names().await {
            if !wanted.contains(&alias) {
                self.remove_macro(&alias).await?;
                summary.removed.push(alias);
            }
        }
        info!(
            "Reloaded macros: {} added, {} updated, {} removed",
            summary.added.len(),
            summary.updated.len(),
            summary.removed.len()
        );
        Ok(summary)
    }

    fn merge_definition(
        &self,
        current: &MacroDefinition,
        fresh: MacroDefinition,
        mode: VariableMode,
    ) -> Result<Option<MacroDefinition>, GCodeError> {
        let mut updated = current.clone();
        let mut changed = false;

        match (current.rename_existing(), fresh.rename_existing()) {
            (Some(old), Some(new)) if old != new => {
                self.rename_command(old, new)?;
                updated = updated.with_rename_existing(new)?;
                changed = true;
            }
            (None, Some(_)) | (Some(_), None) => {
                let message = format!(
                    "Macro {}: rename_existing can only change between names, not be added or removed at runtime",
                    current.alias()
                );
                warn!("{}", message);
                self.respond_info(&message);
            }
            _ => {}
        }

        if current.template_hash() != fresh.template_hash() {
            updated = updated.with_template(fresh.template());
            changed = true;
        }

        if current.description() != fresh.description() {
            updated = updated.with_description(fresh.description());
            changed = true;
        }

        let variables = match mode {
            VariableMode::Skip => None,
            VariableMode::Merge => {
                let mut merged = fresh.variables().clone();
                merged.extend(current.variables().iter().map(|(k, v)| (k.clone(), v.clone())));
                Some(merged)
            }
            VariableMode::Replace => Some(fresh.variables().clone()),
        };
        if let Some(variables) = variables {
            if &variables != current.variables() {
                updated = updated.with_variables(variables);
                changed = true;
            }
        }

        Ok(changed.then_some(updated))
    }

    // Dispatch

    /// Run one line through its handler. Unknown commands are echoed back as
    /// an error response and do not fail the caller.
    pub async fn dispatch_line(self: &Arc<Self>, line: &Arc<Line>) -> Result<(), GCodeError> {
        let Some(command) = line.command() else {
            return Ok(());
        };
        match self.handler_for(command.name()) {
            Some(handler) => handler
                .handle(self, command)
                .await
                .map_err(|e| e.at_line(line)),
            None => {
                let message = format!(
                    "Unknown command: \"{}\". Backtrace:\n{}",
                    command.name(),
                    line.backtrace()
                );
                warn!("{}", message);
                self.respond_error(&message);
                Ok(())
            }
        }
    }

    /// Run a script while holding the dispatch lock. Errors are reported on
    /// the response channel and returned.
    pub async fn run_script(self: &Arc<Self>, script: &str) -> Result<(), GCodeError> {
        let _guard = self.mutex.lock().await;
        let result = self.run_script_from_command(script).await;
        if let Err(e) = &result {
            self.report_error(e);
        }
        result
    }

    /// Run a script from inside a command handler, which already holds the
    /// dispatch lock.
    pub async fn run_script_from_command(self: &Arc<Self>, script: &str) -> Result<(), GCodeError> {
        let mut expander = MacroExpander::for_script(script, Arc::clone(self));
        let result = async {
            while let Some(line) = expander.next_line().await? {
                self.dispatch_line(&line).await?;
            }
            Ok::<(), GCodeError>(())
        }
        .await;
        expander.close().await;
        result
    }

    /// Non-blocking attempt at the dispatch lock; `None` if someone holds it.
    pub fn try_acquire(&self) -> Option<MutexGuard<'_, ()>> {
        self.mutex.try_lock().ok()
    }

    pub async fn acquire(&self) -> MutexGuard<'_, ()> {
        self.mutex.lock().await
    }

    // Responses

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.responses.subscribe()
    }

    pub fn respond_raw(&self, message: &str) {
        debug!("response: {}", message);
        // No subscribers is fine.
        let _ = self.responses.send(message.to_string());
    }

    pub fn respond_info(&self, message: &str) {
        let text = message
            .lines()
            .map(|l| format!("// {}", l))
            .collect::<Vec<_>>()
            .join("\n");
        self.respond_raw(&text);
    }

    pub fn respond_error(&self, message: &str) {
        let mut lines = message.lines();
        let first = lines.next().unwrap_or_default();
        let rest: Vec<&str> = lines.collect();
        if !rest.is_empty() {
            self.respond_info(&rest.join("\n"));
        }
        self.respond_raw(&format!("!! {}", first));
    }

    /// Report an error, halting the host when it is internal.
    pub fn report_error(&self, error: &GCodeError) {
        let message = error.report();
        self.respond_error(&message);
        if error.is_internal() {
            self.invoke_shutdown(&message);
        }
    }

    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<String> {
        self.shutdown.subscribe()
    }

    pub fn invoke_shutdown(&self, reason: &str) {
        tracing::error!("Shutdown: {}", reason);
        let _ = self.shutdown.send(reason.to_string());
    }
}

/// `SET_GCODE_VARIABLE MACRO=<name> VARIABLE=<var> VALUE=<literal>`
struct SetVariable;

#[async_trait]
impl CommandHandler for SetVariable {
    async fn handle(&self, dispatcher: &Arc<Dispatcher>, command: &Command) -> Result<(), GCodeError> {
        let macro_name = command.require("MACRO")?;
        let variable = command.require("VARIABLE")?.to_lowercase();
        let value = parse_literal(command.require("VALUE")?)?;
        dispatcher
            .macros()
            .set_variable(macro_name, &variable, value)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gcode::LineOrigin;

    fn dispatcher() -> Arc<Dispatcher> {
        Dispatcher::new(FileManager::new("."), Arc::new(HandlebarsEngine::new()))
    }

    struct Nop;

    #[async_trait]
    impl CommandHandler for Nop {
        async fn handle(&self, _: &Arc<Dispatcher>, _: &Command) -> Result<(), GCodeError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_unknown_command_is_echoed_not_fatal() {
        let d = dispatcher();
        let mut rx = d.subscribe();
        let line = Line::new("FROB X=1", LineOrigin::Script { number: 1 }, None);
        d.dispatch_line(&line).await.unwrap();
        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first, "//   - script:1: FROB X=1");
        assert_eq!(second, "!! Unknown command: \"FROB\". Backtrace:");
    }

    #[tokio::test]
    async fn test_rename_and_restore() {
        let d = dispatcher();
        d.register_command("G28", Arc::new(Nop), Some("Home"));
        d.register_command("M400", Arc::new(Nop), None);
        let wait = MacroDefinition::new("M400", "M400.1").unwrap().with_rename_existing("M400.1").unwrap();
        d.load_macro(wait).await.unwrap();
        assert!(d.command_help().contains(&(
            "M400.1".to_string(),
            Some("Renamed builtin of 'M400'".to_string())
        )));
        let def = MacroDefinition::new("G28", "G28.1 {{rawparams}}")
            .unwrap()
            .with_rename_existing("G28.1")
            .unwrap();
        d.load_macro(def).await.unwrap();
        assert!(d.has_command("G28.1"));
        assert!(!d.has_command("G28"));

        d.remove_macro("G28").await.unwrap();
        assert!(d.has_command("G28"));
        assert!(!d.has_command("G28.1"));
    }

    #[tokio::test]
    async fn test_rename_of_missing_command_fails() {
        let d = dispatcher();
        let def = MacroDefinition::new("M600", "M601").unwrap().with_rename_existing("M601").unwrap();
        let err = d.load_macro(def).await.unwrap_err();
        assert!(matches!(err, GCodeError::Config(_)));
        assert!(!d.macros().contains("M600").await);
    }

    #[tokio::test]
    async fn test_macro_cannot_shadow_command_without_rename() {
        let d = dispatcher();
        d.register_command("G28", Arc::new(Nop), Some("Home"));
        let err = d
            .load_macro(MacroDefinition::new("g28", "G1 X0").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, GCodeError::DuplicateMacro(name) if name == "G28"));
        assert!(!d.macros().contains("G28").await);
        assert!(d.has_command("G28"));

        let err = d
            .load_macro(MacroDefinition::new("SET_GCODE_VARIABLE", "M117").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, GCodeError::DuplicateMacro(_)));
    }

    #[tokio::test]
    async fn test_lock_is_exclusive() {
        let d = dispatcher();
        let guard = d.try_acquire();
        assert!(guard.is_some());
        assert!(d.try_acquire().is_none());
        drop(guard);
        assert!(d.try_acquire().is_some());
    }
}
