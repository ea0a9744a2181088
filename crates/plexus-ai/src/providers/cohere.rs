use serde_json::{json, Value};

use super::chat::{ChatAdapter, ChatCompletion, ChatWireFormat};
use crate::adapter::AdapterConfig;
use crate::error::{PlexusError, PlexusErrorCode};
use crate::stream::{StreamDecoder, StreamRecord};
use crate::types::{Conversation, Message, PredictOptions, Role};
use crate::usage::RawUsage;

pub type CohereChatAdapter = ChatAdapter<CohereChat>;

/// Cohere `chat` endpoint. The system prompt travels as `preamble`, the latest
/// human turn as `message`, and earlier turns as `chat_history`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CohereChat;

impl CohereChatAdapter {
    pub fn cohere(config: AdapterConfig) -> Result<Self, PlexusError> {
        ChatAdapter::new(CohereChat, config)
    }
}

impl ChatWireFormat for CohereChat {
    fn provider(&self) -> &str {
        "cohere"
    }

    fn credential_env(&self) -> &str {
        "COHERE_API_KEY"
    }

    fn endpoint_path(&self) -> &str {
        "chat"
    }

    fn supports_tools(&self) -> bool {
        false
    }

    fn build_payload(
        &self,
        model: &str,
        conversation: &Conversation,
        options: &PredictOptions,
        stream: bool,
    ) -> Value {
        // Without a human turn the latest message stands in as `message`.
        let messages = conversation.messages();
        let latest = messages
            .iter()
            .rposition(|message| message.role == Role::Human)
            .or_else(|| messages.len().checked_sub(1));
        let (history, message) = match latest {
            Some(index) => (&messages[..index], messages[index].content.as_str()),
            None => (messages, ""),
        };

        let mut payload = json!({
            "model": model,
            "message": message,
            "chat_history": convert_history(history),
            "temperature": options.temperature,
            "max_tokens": options.max_tokens,
            "stream": stream,
        });
        if let Some(preamble) = conversation.last_content(Role::System) {
            payload["preamble"] = Value::String(preamble.to_string());
        }
        payload
    }

    fn parse_response(&self, body: &Value) -> Result<ChatCompletion, PlexusError> {
        let text = body.get("text").and_then(Value::as_str).ok_or_else(|| {
            PlexusError::new(
                PlexusErrorCode::ProviderProtocol,
                "cohere response has no text",
            )
            .with_details(json!({ "body": body }))
        })?;

        Ok(ChatCompletion {
            content: Some(text.to_string()),
            tool_calls: Vec::new(),
            usage: usage_block(body).map(RawUsage::from_value).unwrap_or_default(),
        })
    }

    fn stream_decoder(&self) -> Box<dyn StreamDecoder> {
        Box::new(CohereStreamDecoder)
    }
}

fn convert_history(messages: &[Message]) -> Vec<Value> {
    messages
        .iter()
        .filter_map(|message| {
            let role = match message.role {
                Role::Human => "USER",
                Role::Assistant => "CHATBOT",
                Role::System | Role::Tool => return None,
            };
            Some(json!({ "role": role, "message": message.content }))
        })
        .collect()
}

fn usage_block(body: &Value) -> Option<&Value> {
    body.get("usage")
        .filter(|usage| usage.is_object())
        .or_else(|| body.get("meta").and_then(|meta| meta.get("billed_units")))
}

/// One JSON object per line. `stream-end` closes the stream and carries the
/// final response with billed token counts.
struct CohereStreamDecoder;

impl StreamDecoder for CohereStreamDecoder {
    fn decode_line(&mut self, line: &str) -> Option<Vec<StreamRecord>> {
        let event: Value = serde_json::from_str(line.trim()).ok()?;
        if !event.is_object() {
            return None;
        }

        let mut records = Vec::new();
        match event.get("event_type").and_then(Value::as_str) {
            Some("stream-end") => {
                if let Some(usage) = event.get("response").and_then(usage_block) {
                    records.push(StreamRecord::Usage(RawUsage::from_value(usage)));
                }
                records.push(StreamRecord::Done);
            }
            Some("text-generation") | None => {
                if let Some(text) = event.get("text").and_then(Value::as_str) {
                    records.push(StreamRecord::Delta(text.to_string()));
                }
                if let Some(usage) = usage_block(&event) {
                    records.push(StreamRecord::Usage(RawUsage::from_value(usage)));
                }
            }
            Some(_) => {}
        }
        Some(records)
    }
}
