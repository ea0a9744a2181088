use serde_json::{json, Value};

use super::chat::{ChatAdapter, ChatCompletion, ChatWireFormat};
use crate::adapter::AdapterConfig;
use crate::error::{PlexusError, PlexusErrorCode};
use crate::stream::{StreamDecoder, StreamRecord};
use crate::toolkit::FunctionSchemaConverter;
use crate::types::{Conversation, Message, PredictOptions, Role, ToolCallRequest};
use crate::usage::RawUsage;

pub type OpenAiChatAdapter = ChatAdapter<OpenAiChat>;

/// Wire format of OpenAI-compatible `chat/completions` endpoints.
#[derive(Debug, Clone)]
pub struct OpenAiChat {
    provider: String,
    credential_env: String,
    endpoint_path: String,
    supports_tools: bool,
}

impl OpenAiChat {
    pub fn groq() -> Self {
        Self::compatible("groq", "GROQ_API_KEY", true)
    }

    pub fn deepseek() -> Self {
        Self::compatible("deepseek", "DEEPSEEK_API_KEY", true)
    }

    pub fn compatible(
        provider: impl Into<String>,
        credential_env: impl Into<String>,
        supports_tools: bool,
    ) -> Self {
        Self {
            provider: provider.into(),
            credential_env: credential_env.into(),
            endpoint_path: "chat/completions".to_string(),
            supports_tools,
        }
    }
}

impl OpenAiChatAdapter {
    pub fn groq(config: AdapterConfig) -> Result<Self, PlexusError> {
        ChatAdapter::new(OpenAiChat::groq(), config)
    }

    pub fn deepseek(config: AdapterConfig) -> Result<Self, PlexusError> {
        ChatAdapter::new(OpenAiChat::deepseek(), config)
    }
}

impl ChatWireFormat for OpenAiChat {
    fn provider(&self) -> &str {
        &self.provider
    }

    fn credential_env(&self) -> &str {
        &self.credential_env
    }

    fn endpoint_path(&self) -> &str {
        &self.endpoint_path
    }

    fn supports_tools(&self) -> bool {
        self.supports_tools
    }

    fn build_payload(
        &self,
        model: &str,
        conversation: &Conversation,
        options: &PredictOptions,
        stream: bool,
    ) -> Value {
        let mut payload = json!({
            "model": model,
            "messages": convert_messages(conversation.messages()),
            "temperature": options.temperature,
            "max_tokens": options.max_tokens,
        });
        if stream {
            payload["stream"] = Value::Bool(true);
        }
        if let Some(toolkit) = options.toolkit.as_deref() {
            if !toolkit.is_empty() {
                payload["tools"] = Value::Array(toolkit.schemas(&FunctionSchemaConverter));
                if let Some(tool_choice) = options.resolved_tool_choice() {
                    payload["tool_choice"] = Value::String(tool_choice);
                }
            }
        }
        payload
    }

    fn parse_response(&self, body: &Value) -> Result<ChatCompletion, PlexusError> {
        let message = body
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first())
            .and_then(|choice| choice.get("message"))
            .ok_or_else(|| {
                PlexusError::new(
                    PlexusErrorCode::ProviderProtocol,
                    format!("{} response has no choices", self.provider),
                )
                .with_details(json!({ "body": body }))
            })?;

        let content = message
            .get("content")
            .and_then(Value::as_str)
            .map(str::to_string);
        let tool_calls = match message.get("tool_calls").and_then(Value::as_array) {
            Some(calls) => calls
                .iter()
                .map(|call| parse_tool_call(&self.provider, call))
                .collect::<Result<Vec<_>, _>>()?,
            None => Vec::new(),
        };

        Ok(ChatCompletion {
            content,
            tool_calls,
            usage: usage_block(body).map(RawUsage::from_value).unwrap_or_default(),
        })
    }

    fn stream_decoder(&self) -> Box<dyn StreamDecoder> {
        Box::new(OpenAiStreamDecoder)
    }
}

fn convert_messages(messages: &[Message]) -> Vec<Value> {
    messages
        .iter()
        .map(|message| match message.role {
            Role::System => json!({ "role": "system", "content": message.content }),
            Role::Human => json!({ "role": "user", "content": message.content }),
            Role::Assistant => {
                let mut converted = json!({
                    "role": "assistant",
                    "content": message.content,
                });
                if let Some(tool_calls) = &message.tool_calls {
                    converted["tool_calls"] = tool_calls
                        .iter()
                        .map(|call| {
                            json!({
                                "id": call.id,
                                "type": "function",
                                "function": {
                                    "name": call.function_name,
                                    "arguments": call.arguments.to_string(),
                                }
                            })
                        })
                        .collect();
                }
                converted
            }
            Role::Tool => json!({
                "role": "tool",
                "content": message.content,
                "tool_call_id": message.tool_call_id,
                "name": message.name,
            }),
        })
        .collect()
}

/// Tool arguments arrive as a JSON-encoded string; some servers send an object.
fn parse_tool_call(provider: &str, call: &Value) -> Result<ToolCallRequest, PlexusError> {
    let id = call.get("id").and_then(Value::as_str).unwrap_or_default();
    let function = call.get("function");
    let name = function
        .and_then(|function| function.get("name"))
        .and_then(Value::as_str)
        .ok_or_else(|| {
            PlexusError::new(
                PlexusErrorCode::ProviderProtocol,
                format!("{provider} tool call is missing a function name"),
            )
            .with_details(json!({ "toolCall": call }))
        })?;

    let arguments = match function.and_then(|function| function.get("arguments")) {
        Some(Value::String(raw)) if raw.trim().is_empty() => json!({}),
        Some(Value::String(raw)) => serde_json::from_str(raw).map_err(|error| {
            PlexusError::new(
                PlexusErrorCode::ProviderProtocol,
                format!("{provider} sent unparseable arguments for tool '{name}': {error}"),
            )
            .with_details(json!({ "toolCallId": id, "arguments": raw }))
        })?,
        Some(other) => other.clone(),
        None => json!({}),
    };

    Ok(ToolCallRequest::new(id, name, arguments))
}

/// Groq reports streaming usage under `x_groq`.
fn usage_block(chunk: &Value) -> Option<&Value> {
    chunk
        .get("usage")
        .filter(|usage| usage.is_object())
        .or_else(|| chunk.get("x_groq").and_then(|extra| extra.get("usage")))
}

/// `data: {...}` server-sent events terminated by `data: [DONE]`. Bare JSON
/// lines are accepted too.
struct OpenAiStreamDecoder;

impl StreamDecoder for OpenAiStreamDecoder {
    fn decode_line(&mut self, line: &str) -> Option<Vec<StreamRecord>> {
        let data = match line.strip_prefix("data:") {
            Some(data) => data.trim(),
            None if line.starts_with(':')
                || line.starts_with("event:")
                || line.starts_with("id:") =>
            {
                return Some(Vec::new());
            }
            None => line.trim(),
        };
        if data == "[DONE]" {
            return Some(vec![StreamRecord::Done]);
        }

        let chunk: Value = serde_json::from_str(data).ok()?;
        let mut records = Vec::new();
        if let Some(delta) = chunk
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first())
            .and_then(|choice| choice.get("delta"))
            .and_then(|delta| delta.get("content"))
            .and_then(Value::as_str)
        {
            records.push(StreamRecord::Delta(delta.to_string()));
        }
        if let Some(usage) = usage_block(&chunk) {
            records.push(StreamRecord::Usage(RawUsage::from_value(usage)));
        }
        Some(records)
    }
}
