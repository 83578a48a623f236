//! Plugin loading
//!
//! The `PLUGINS` environment variable names plugin identifiers to load at
//! startup. A plugin contributes toolsets; the registry maps identifiers to
//! factories so deployments pick capabilities without code changes.

use std::collections::HashMap;
use std::sync::Arc;
use xpert_core::{SimpleToolset, Tool, Toolset};

/// Builds a toolset for a plugin identifier
pub type ToolsetFactory = Arc<dyn Fn() -> Arc<dyn Toolset> + Send + Sync>;

/// Registry of available plugins
#[derive(Default, Clone)]
pub struct PluginRegistry {
    factories: HashMap<String, ToolsetFactory>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in plugins
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("calculator", Arc::new(calculator_toolset));
        registry
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        factory: Arc<dyn Fn() -> Arc<dyn Toolset> + Send + Sync>,
    ) {
        self.factories.insert(name.into(), factory);
    }

    /// Instantiate the toolsets named in the plugin list; unknown names are
    /// logged and skipped
    pub fn load(&self, plugins: &[String]) -> Vec<Arc<dyn Toolset>> {
        let mut toolsets = Vec::new();
        for name in plugins {
            match self.factories.get(name) {
                Some(factory) => {
                    tracing::info!(plugin = %name, "plugin loaded");
                    toolsets.push(factory());
                }
                None => tracing::warn!(plugin = %name, "unknown plugin, skipping"),
            }
        }
        toolsets
    }
}

fn calculator_toolset() -> Arc<dyn Toolset> {
    let add = Tool::from_fn(
        "add",
        "Add two numbers",
        serde_json::json!({
            "type": "object",
            "properties": {"a": {"type": "number"}, "b": {"type": "number"}},
            "required": ["a", "b"],
        }),
        |args, _invocation| async move {
            let a = args["a"].as_f64().unwrap_or(0.0);
            let b = args["b"].as_f64().unwrap_or(0.0);
            Ok(serde_json::json!(a + b))
        },
    );
    let multiply = Tool::from_fn(
        "multiply",
        "Multiply two numbers",
        serde_json::json!({
            "type": "object",
            "properties": {"a": {"type": "number"}, "b": {"type": "number"}},
            "required": ["a", "b"],
        }),
        |args, _invocation| async move {
            let a = args["a"].as_f64().unwrap_or(0.0);
            let b = args["b"].as_f64().unwrap_or(0.0);
            Ok(serde_json::json!(a * b))
        },
    );
    Arc::new(SimpleToolset::new(
        "calculator",
        "calculator",
        vec![add, multiply],
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_known_and_unknown() {
        let registry = PluginRegistry::with_builtins();
        let toolsets = registry.load(&[
            "calculator".to_string(),
            "does-not-exist".to_string(),
        ]);
        assert_eq!(toolsets.len(), 1);
        assert_eq!(toolsets[0].id(), "calculator");
    }
}
