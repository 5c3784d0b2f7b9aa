//! Function-calling tools exposed to the realtime model.
//!
//! A tool receives the JSON arguments streamed by the model and always
//! produces a result object; failures are folded into that object (with
//! `error` and a speakable `response`) rather than propagated, so the
//! model can apologise out loud instead of going silent.

mod netinfo;

pub use self::netinfo::{NetInfoClient, NetInfoError, NetInfoTool, QueryReply};

use async_trait::async_trait;
use serde_json::{json, Value};
use std::{fmt, sync::Arc};
use tracing::{info, warn};

/// A model-invocable function.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The function name advertised in the session's tool schema.
    fn name(&self) -> &str;

    /// The OpenAI tool definition (`type`, `name`, `description`,
    /// `parameters`).
    fn definition(&self) -> Value;

    /// Runs the tool. Must return a result object even on failure.
    async fn invoke(&self, arguments: Value) -> Value;
}

/// The tools offered to one realtime session.
#[derive(Clone, Default)]
pub struct ToolSet {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a tool to the set.
    #[must_use]
    pub fn with(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Definitions for the `session.update` tool schema.
    pub fn definitions(&self) -> Vec<Value> {
        self.tools.iter().map(|t| t.definition()).collect()
    }

    /// Dispatches a completed function call by name.
    ///
    /// Unknown names produce an apologetic result object, mirroring how
    /// backend failures are reported.
    pub async fn dispatch(&self, name: &str, arguments: Value) -> Value {
        let Some(tool) = self.tools.iter().find(|t| t.name() == name) else {
            warn!("Model invoked unknown function {name:?}.");
            return json!({
                "error": format!("unknown function: {name}"),
                "response": "Lo siento, no puedo procesar esa solicitud.",
            });
        };

        info!("Dispatching tool {name}.");
        tool.invoke(arguments).await
    }
}

impl fmt::Debug for ToolSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.tools.iter().map(|t| t.name()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl Tool for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        fn definition(&self) -> Value {
            json!({"type": "function", "name": "echo", "parameters": {}})
        }

        async fn invoke(&self, arguments: Value) -> Value {
            json!({"success": true, "response": arguments["text"]})
        }
    }

    #[tokio::test]
    async fn dispatches_by_name() {
        let tools = ToolSet::new().with(Arc::new(Echo));

        let out = tools.dispatch("echo", json!({"text": "hola"})).await;
        assert_eq!(out["response"], "hola");
    }

    #[tokio::test]
    async fn unknown_tool_yields_spoken_error() {
        let tools = ToolSet::new().with(Arc::new(Echo));

        let out = tools.dispatch("nope", json!({})).await;
        assert!(out["error"].as_str().unwrap().contains("nope"));
        assert!(out["response"].as_str().is_some());
    }

    #[test]
    fn definitions_cover_all_tools() {
        let tools = ToolSet::new().with(Arc::new(Echo));
        let defs = tools.definitions();
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0]["name"], "echo");
    }
}
