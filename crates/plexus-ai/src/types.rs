use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::toolkit::Toolkit;
use crate::usage::UsageStats;

pub const DEFAULT_TEMPERATURE: f64 = 0.7;
pub const DEFAULT_MAX_TOKENS: u32 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    #[serde(rename = "system")]
    System,
    #[serde(rename = "human")]
    Human,
    #[serde(rename = "assistant")]
    Assistant,
    #[serde(rename = "tool")]
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::Human => "human",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    #[serde(rename = "functionName")]
    pub function_name: String,
    pub arguments: Value,
}

impl ToolCallRequest {
    pub fn new(id: impl Into<String>, function_name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: id.into(),
            function_name: function_name.into(),
            arguments,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub name: Option<String>,
    #[serde(rename = "toolCallId", skip_serializing_if = "Option::is_none", default)]
    pub tool_call_id: Option<String>,
    #[serde(rename = "toolCalls", skip_serializing_if = "Option::is_none", default)]
    pub tool_calls: Option<Vec<ToolCallRequest>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub usage: Option<UsageStats>,
}

impl Message {
    fn with_role(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            name: None,
            tool_call_id: None,
            tool_calls: None,
            usage: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role(Role::System, content)
    }

    pub fn human(content: impl Into<String>) -> Self {
        Self::with_role(Role::Human, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role(Role::Assistant, content)
    }

    pub fn tool(
        content: impl Into<String>,
        name: impl Into<String>,
        tool_call_id: impl Into<String>,
    ) -> Self {
        Self {
            name: Some(name.into()),
            tool_call_id: Some(tool_call_id.into()),
            ..Self::with_role(Role::Tool, content)
        }
    }

    pub fn with_usage(mut self, usage: UsageStats) -> Self {
        self.usage = Some(usage);
        self
    }

    pub fn with_tool_calls(mut self, tool_calls: Vec<ToolCallRequest>) -> Self {
        if !tool_calls.is_empty() {
            self.tool_calls = Some(tool_calls);
        }
        self
    }
}

/// Append-only chat transcript. Messages are only reachable by shared
/// reference once appended.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    messages: Vec<Message>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_system(prompt: impl Into<String>) -> Self {
        let mut conversation = Self::new();
        conversation.append(Message::system(prompt));
        conversation
    }

    pub fn append(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Content of the most recent message with the given role.
    pub fn last_content(&self, role: Role) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|message| message.role == role)
            .map(|message| message.content.as_str())
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct PredictOptions {
    pub temperature: f64,
    pub max_tokens: u32,
    pub toolkit: Option<Arc<Toolkit>>,
    pub tool_choice: Option<String>,
}

impl Default for PredictOptions {
    fn default() -> Self {
        Self {
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
            toolkit: None,
            tool_choice: None,
        }
    }
}

impl PredictOptions {
    pub fn with_toolkit(mut self, toolkit: Arc<Toolkit>) -> Self {
        self.toolkit = Some(toolkit);
        self
    }

    pub fn with_tool_choice(mut self, tool_choice: impl Into<String>) -> Self {
        self.tool_choice = Some(tool_choice.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// A toolkit without an explicit choice lets the model decide.
    pub fn resolved_tool_choice(&self) -> Option<String> {
        self.tool_choice
            .clone()
            .or_else(|| self.toolkit.as_ref().map(|_| "auto".to_string()))
    }

    pub fn without_tools(&self) -> Self {
        Self {
            toolkit: None,
            tool_choice: None,
            ..self.clone()
        }
    }
}
