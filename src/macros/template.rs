use handlebars::Handlebars;
use serde_json::Value;

use crate::error::GCodeError;

/// Renders a macro body against a JSON context.
pub trait TemplateEngine: Send + Sync {
    fn render(&self, name: &str, template: &str, context: &Value) -> Result<String, GCodeError>;
}

/// Default engine. Output is G-code, so HTML escaping is turned off.
pub struct HandlebarsEngine {
    registry: Handlebars<'static>,
}

impl HandlebarsEngine {
    pub fn new() -> Self {
        let mut registry = Handlebars::new();
        registry.register_escape_fn(handlebars::no_escape);
        Self { registry }
    }

    /// Fail rendering when a template references a missing variable.
    pub fn strict() -> Self {
        let mut engine = Self::new();
        engine.registry.set_strict_mode(true);
        engine
    }
}

impl Default for HandlebarsEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateEngine for HandlebarsEngine {
    fn render(&self, name: &str, template: &str, context: &Value) -> Result<String, GCodeError> {
        self.registry
            .render_template(template, context)
            .map_err(|e| GCodeError::command(format!("Error evaluating '{}': {}", name, e)))
    }
}
