use serde_json::{json, Value};
use tracing::{debug, info};

use crate::error::{PlexusError, PlexusErrorCode};
use crate::toolkit::{ToolInvokeError, Toolkit};
use crate::types::{Conversation, Message, ToolCallRequest};
use crate::usage::UsageStats;

/// One decoded (non-streaming) model response.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AssistantTurn {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCallRequest>,
    pub usage: Option<UsageStats>,
}

impl AssistantTurn {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Self::default()
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// Appends the assistant message for `turn`, then executes its tool calls in
/// backend order, appending one tool message per call.
///
/// The assistant message is appended even when the turn has no text: it holds
/// the tool calls that the following tool messages answer.
///
/// A missing tool, invalid arguments, or a failing tool aborts the loop. Tool
/// messages already appended stay in the conversation.
pub fn apply_assistant_turn(
    conversation: &mut Conversation,
    turn: AssistantTurn,
    toolkit: Option<&Toolkit>,
) -> Result<(), PlexusError> {
    let AssistantTurn {
        content,
        tool_calls,
        usage,
    } = turn;

    let mut assistant =
        Message::assistant(content.unwrap_or_default()).with_tool_calls(tool_calls.clone());
    assistant.usage = usage;
    conversation.append(assistant);

    if tool_calls.is_empty() {
        return Ok(());
    }

    info!(count = tool_calls.len(), "executing tool calls");
    for tool_call in &tool_calls {
        let message = execute_tool_call(toolkit, tool_call)?;
        conversation.append(message);
    }
    Ok(())
}

fn execute_tool_call(
    toolkit: Option<&Toolkit>,
    tool_call: &ToolCallRequest,
) -> Result<Message, PlexusError> {
    let tool = match toolkit {
        Some(toolkit) => toolkit.get(&tool_call.function_name)?,
        None => return Err(tool_not_found_without_toolkit(&tool_call.function_name)),
    };
    tool.validate_arguments(tool_call)?;

    debug!(
        tool = %tool_call.function_name,
        tool_call_id = %tool_call.id,
        arguments = %tool_call.arguments,
        "invoking tool"
    );
    let result = tool
        .invoke(tool_call.arguments.clone())
        .map_err(|error| tool_execution_error(tool_call, error))?;

    Ok(Message::tool(
        render_tool_result(&result),
        tool_call.function_name.clone(),
        tool_call.id.clone(),
    ))
}

/// Strings are passed through as-is; every other value is sent as compact JSON.
pub fn render_tool_result(result: &Value) -> String {
    match result {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn tool_not_found_without_toolkit(name: &str) -> PlexusError {
    PlexusError::new(
        PlexusErrorCode::ToolNotFound,
        format!("Tool '{name}' not found: no toolkit supplied"),
    )
    .with_details(json!({
        "toolName": name,
        "availableTools": [],
    }))
}

fn tool_execution_error(tool_call: &ToolCallRequest, error: ToolInvokeError) -> PlexusError {
    PlexusError::new(
        PlexusErrorCode::ToolExecutionFailed,
        format!("Tool '{}' failed: {error}", tool_call.function_name),
    )
    .with_details(json!({
        "toolName": tool_call.function_name,
        "toolCallId": tool_call.id,
        "cause": error.to_string(),
    }))
}
