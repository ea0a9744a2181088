use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use jsonschema::JSONSchema;
use serde_json::{json, Value};

use crate::error::{PlexusError, PlexusErrorCode};
use crate::types::ToolCallRequest;

pub type ToolInvokeError = Box<dyn std::error::Error + Send + Sync>;

/// Tools run synchronously inside the tool-call loop; they are expected to be fast and local.
pub trait ToolInvoker: Send + Sync {
    fn invoke(&self, arguments: Value) -> Result<Value, ToolInvokeError>;
}

impl<F> ToolInvoker for F
where
    F: Fn(Value) -> Result<Value, ToolInvokeError> + Send + Sync + 'static,
{
    fn invoke(&self, arguments: Value) -> Result<Value, ToolInvokeError> {
        (self)(arguments)
    }
}

#[derive(Clone)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
    pub invoker: Arc<dyn ToolInvoker>,
}

impl ToolDefinition {
    pub fn new<I>(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
        invoker: I,
    ) -> Self
    where
        I: ToolInvoker + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            invoker: Arc::new(invoker),
        }
    }

    pub fn invoke(&self, arguments: Value) -> Result<Value, ToolInvokeError> {
        self.invoker.invoke(arguments)
    }

    /// Checks call arguments against the parameter schema. A tool without a
    /// schema accepts anything.
    pub fn validate_arguments(&self, tool_call: &ToolCallRequest) -> Result<(), PlexusError> {
        if self.parameters.is_null() {
            return Ok(());
        }

        let compiled = JSONSchema::compile(&self.parameters).map_err(|error| {
            PlexusError::new(
                PlexusErrorCode::SchemaInvalid,
                format!("Invalid JSON schema for tool '{}': {error}", self.name),
            )
            .with_details(json!({
                "toolName": self.name,
            }))
        })?;

        if let Err(errors) = compiled.validate(&tool_call.arguments) {
            let validation_errors = errors
                .map(|error| {
                    json!({
                        "path": error.instance_path.to_string(),
                        "message": error.to_string(),
                    })
                })
                .collect::<Vec<_>>();

            return Err(PlexusError::new(
                PlexusErrorCode::ToolArgumentsInvalid,
                format!("Validation failed for tool '{}'", self.name),
            )
            .with_details(json!({
                "toolName": self.name,
                "toolCallId": tool_call.id,
                "arguments": tool_call.arguments,
                "validationErrors": validation_errors,
            })));
        }

        Ok(())
    }
}

impl Debug for ToolDefinition {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolDefinition")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("parameters", &self.parameters)
            .finish_non_exhaustive()
    }
}

/// Name-indexed tool registry. Iteration follows registration order so
/// tool schemas are sent to backends deterministically.
#[derive(Clone, Default)]
pub struct Toolkit {
    tools: HashMap<String, ToolDefinition>,
    order: Vec<String>,
}

impl Toolkit {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registering a name twice replaces the earlier definition in place.
    pub fn add_tool(&mut self, tool: ToolDefinition) {
        if !self.tools.contains_key(&tool.name) {
            self.order.push(tool.name.clone());
        }
        self.tools.insert(tool.name.clone(), tool);
    }

    pub fn with_tool(mut self, tool: ToolDefinition) -> Self {
        self.add_tool(tool);
        self
    }

    pub fn get(&self, name: &str) -> Result<&ToolDefinition, PlexusError> {
        self.tools.get(name).ok_or_else(|| {
            PlexusError::new(
                PlexusErrorCode::ToolNotFound,
                format!("Tool '{name}' not found"),
            )
            .with_details(json!({
                "toolName": name,
                "availableTools": self.order,
            }))
        })
    }

    pub fn names(&self) -> &[String] {
        &self.order
    }

    pub fn iter(&self) -> impl Iterator<Item = &ToolDefinition> {
        self.order.iter().filter_map(|name| self.tools.get(name))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn schemas(&self, converter: &dyn SchemaConverter) -> Vec<Value> {
        self.iter().map(|tool| converter.convert(tool)).collect()
    }
}

impl Debug for Toolkit {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Toolkit").field("tools", &self.order).finish()
    }
}

/// Maps a tool definition onto the JSON shape a backend expects in its `tools` array.
pub trait SchemaConverter: Send + Sync {
    fn convert(&self, tool: &ToolDefinition) -> Value;
}

/// `{"type": "function", "function": {...}}`, shared by OpenAI-compatible backends.
#[derive(Debug, Clone, Copy, Default)]
pub struct FunctionSchemaConverter;

impl SchemaConverter for FunctionSchemaConverter {
    fn convert(&self, tool: &ToolDefinition) -> Value {
        let parameters = if tool.parameters.is_null() {
            json!({ "type": "object", "properties": {} })
        } else {
            tool.parameters.clone()
        };
        json!({
            "type": "function",
            "function": {
                "name": tool.name,
                "description": tool.description,
                "parameters": parameters,
            }
        })
    }
}
