use crate::models::ToolCall;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

/// Callback invoked when the model asks for a registered tool.
///
/// Receives the decoded argument object and returns the textual result the
/// model will see. Application errors surface as [`ToolError::Callback`].
pub type FunctionToolCallback =
    Arc<dyn Fn(serde_json::Map<String, serde_json::Value>) -> anyhow::Result<String> + Send + Sync>;

/// Errors raised while dispatching a tool call.
///
/// These are recovered inside the handlers' tool loops: the failing call's
/// result becomes an `"Error: ..."` tool message and the exchange continues.
#[derive(Error, Debug)]
pub enum ToolError {
    #[error("unknown function tool: {0}")]
    UnknownTool(String),

    #[error("failed to parse tool call arguments: {0}")]
    InvalidArguments(#[from] serde_json::Error),

    #[error("tool callback failed: {0}")]
    Callback(anyhow::Error),
}

/// A registered tool: name, description, JSON schema and callback.
#[derive(Clone)]
pub struct FunctionToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema describing the callback's parameters.
    pub parameters: serde_json::Value,
    pub callback: FunctionToolCallback,
}

impl std::fmt::Debug for FunctionToolDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionToolDefinition")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("parameters", &self.parameters)
            .finish_non_exhaustive()
    }
}

/// Wire-format tool entry for OpenAI-shaped request construction.
#[derive(Debug, Clone, Serialize)]
pub struct ToolSpec {
    #[serde(rename = "type")]
    pub kind: String,
    pub function: ToolSpecFunction,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolSpecFunction {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Registry mapping tool name to definition, shared with in-flight queries.
///
/// Registration is last-write-wins and may race with dispatch, so the map
/// is concurrent and independent of any handler lock.
#[derive(Default, Debug)]
pub struct FunctionToolManager {
    tools: DashMap<String, FunctionToolDefinition>,
}

impl FunctionToolManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool; an existing tool with the same name is replaced.
    pub fn register_tool(
        &self,
        name: &str,
        description: &str,
        parameters: serde_json::Value,
        callback: FunctionToolCallback,
    ) {
        self.register_definition(FunctionToolDefinition {
            name: name.to_string(),
            description: description.to_string(),
            parameters,
            callback,
        });
    }

    pub fn register_definition(&self, def: FunctionToolDefinition) {
        tracing::info!("Function tool registered: {}", def.name);
        self.tools.insert(def.name.clone(), def);
    }

    /// Wire-format list of every registered tool, for request construction.
    pub fn tools(&self) -> Vec<ToolSpec> {
        self.tools
            .iter()
            .map(|entry| ToolSpec {
                kind: "function".to_string(),
                function: ToolSpecFunction {
                    name: entry.name.clone(),
                    description: entry.description.clone(),
                    parameters: entry.parameters.clone(),
                },
            })
            .collect()
    }

    pub fn get(&self, name: &str) -> Option<FunctionToolDefinition> {
        self.tools.get(name).map(|entry| entry.value().clone())
    }

    pub fn list(&self) -> Vec<String> {
        self.tools.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Look up the tool named by `call`, decode its arguments and invoke
    /// the callback.
    pub fn dispatch(&self, call: &ToolCall) -> Result<String, ToolError> {
        let def = self
            .get(&call.function.name)
            .ok_or_else(|| ToolError::UnknownTool(call.function.name.clone()))?;

        let args: serde_json::Map<String, serde_json::Value> =
            serde_json::from_str(&call.function.arguments)?;

        match (def.callback)(args) {
            Ok(result) => {
                tracing::info!(
                    "Tool call completed: {} -> {}",
                    call.function.name,
                    result
                );
                Ok(result)
            }
            Err(err) => {
                tracing::error!("Tool call failed: {}: {}", call.function.name, err);
                Err(ToolError::Callback(err))
            }
        }
    }
}
