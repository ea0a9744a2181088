use std::borrow::Cow;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info};

use super::common::{auth_headers, HttpClients};
use crate::adapter::{AdapterConfig, ProviderAdapter};
use crate::error::PlexusError;
use crate::stream::{BlockingTextStream, StreamAggregator, StreamDecoder, TextStream};
use crate::tool_loop::{apply_assistant_turn, AssistantTurn};
use crate::types::{Conversation, PredictOptions, ToolCallRequest};
use crate::usage::{account, RawUsage};

/// A decoded non-streaming chat response, before usage accounting.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatCompletion {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCallRequest>,
    pub usage: RawUsage,
}

impl ChatCompletion {
    fn into_turn(self, prompt_elapsed: Duration, completion_elapsed: Duration) -> AssistantTurn {
        AssistantTurn {
            content: self.content,
            tool_calls: self.tool_calls,
            usage: Some(account(&self.usage, prompt_elapsed, completion_elapsed)),
        }
    }
}

/// Backend-specific request and response shapes of a chat endpoint.
pub trait ChatWireFormat: Send + Sync {
    fn provider(&self) -> &str;

    fn credential_env(&self) -> &str;

    fn endpoint_path(&self) -> &str;

    fn supports_tools(&self) -> bool;

    fn build_payload(
        &self,
        model: &str,
        conversation: &Conversation,
        options: &PredictOptions,
        stream: bool,
    ) -> Value;

    fn parse_response(&self, body: &Value) -> Result<ChatCompletion, PlexusError>;

    fn stream_decoder(&self) -> Box<dyn StreamDecoder>;
}

/// [`ProviderAdapter`] over any chat endpoint described by a [`ChatWireFormat`].
pub struct ChatAdapter<W> {
    wire: W,
    model: String,
    http: HttpClients,
}

impl<W: ChatWireFormat> ChatAdapter<W> {
    pub fn new(wire: W, config: AdapterConfig) -> Result<Self, PlexusError> {
        let resolved = config.validated(wire.credential_env())?;
        let http = HttpClients::new(
            wire.provider(),
            &resolved.base_url,
            auth_headers("Bearer", &resolved.api_key)?,
        )?;
        info!(
            provider = wire.provider(),
            model = %resolved.model,
            base_url = %resolved.base_url,
            "chat adapter ready"
        );
        Ok(Self {
            wire,
            model: resolved.model,
            http,
        })
    }

    pub fn wire(&self) -> &W {
        &self.wire
    }

    /// Backends without tool support ignore any toolkit.
    fn effective_options<'o>(&self, options: &'o PredictOptions) -> Cow<'o, PredictOptions> {
        if options.toolkit.is_some() && !self.wire.supports_tools() {
            debug!(
                provider = self.wire.provider(),
                "backend has no tool support; ignoring toolkit"
            );
            return Cow::Owned(options.without_tools());
        }
        Cow::Borrowed(options)
    }

    fn complete_blocking(
        &self,
        conversation: &Conversation,
        options: &PredictOptions,
    ) -> Result<AssistantTurn, PlexusError> {
        let payload = self
            .wire
            .build_payload(&self.model, conversation, options, false);
        info!(provider = self.wire.provider(), model = %self.model, "chat request");
        let (response, prompt_elapsed) = self
            .http
            .post_blocking(self.wire.endpoint_path(), &payload)?;
        let completion_started = Instant::now();
        let body = self.http.read_json_blocking(response)?;
        let completion = self.wire.parse_response(&body)?;
        Ok(completion.into_turn(prompt_elapsed, completion_started.elapsed()))
    }

    async fn complete(
        &self,
        conversation: &Conversation,
        options: &PredictOptions,
    ) -> Result<AssistantTurn, PlexusError> {
        let payload = self
            .wire
            .build_payload(&self.model, conversation, options, false);
        info!(provider = self.wire.provider(), model = %self.model, "chat request");
        let (response, prompt_elapsed) = self
            .http
            .post(self.wire.endpoint_path(), &payload)
            .await?;
        let completion_started = Instant::now();
        let body = self.http.read_json(response).await?;
        let completion = self.wire.parse_response(&body)?;
        Ok(completion.into_turn(prompt_elapsed, completion_started.elapsed()))
    }
}

/// What a tool round before streaming resolved to.
enum ToolRound {
    /// The model answered directly; its text is streamed as-is.
    Answered(AssistantTurn),
    /// Tool messages were appended; stream a follow-up without tools.
    FollowUp,
}

impl<W: ChatWireFormat> ChatAdapter<W> {
    fn settle_tool_round(
        conversation: &mut Conversation,
        turn: AssistantTurn,
        options: &PredictOptions,
    ) -> Result<ToolRound, PlexusError> {
        if !turn.has_tool_calls() {
            return Ok(ToolRound::Answered(turn));
        }
        apply_assistant_turn(conversation, turn, options.toolkit.as_deref())?;
        Ok(ToolRound::FollowUp)
    }
}

fn answered_fragments(turn: &AssistantTurn) -> Vec<String> {
    turn.content
        .iter()
        .filter(|content| !content.is_empty())
        .cloned()
        .collect()
}

#[async_trait]
impl<W: ChatWireFormat> ProviderAdapter for ChatAdapter<W> {
    fn provider(&self) -> &str {
        self.wire.provider()
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn predict(
        &self,
        conversation: &mut Conversation,
        options: &PredictOptions,
    ) -> Result<(), PlexusError> {
        let options = self.effective_options(options);
        let turn = self.complete_blocking(conversation, &options)?;
        apply_assistant_turn(conversation, turn, options.toolkit.as_deref())
    }

    async fn apredict(
        &self,
        conversation: &mut Conversation,
        options: &PredictOptions,
    ) -> Result<(), PlexusError> {
        let options = self.effective_options(options);
        let turn = self.complete(conversation, &options).await?;
        apply_assistant_turn(conversation, turn, options.toolkit.as_deref())
    }

    fn stream<'a>(
        &'a self,
        conversation: &'a mut Conversation,
        options: &PredictOptions,
    ) -> Result<BlockingTextStream<'a>, PlexusError> {
        let options = self.effective_options(options);
        if options.toolkit.is_some() {
            let turn = self.complete_blocking(conversation, &options)?;
            let round = Self::settle_tool_round(conversation, turn, &options)?;
            if let ToolRound::Answered(turn) = round {
                return Ok(BlockingTextStream::ready(
                    answered_fragments(&turn),
                    turn.usage,
                    conversation,
                ));
            }
        }

        let payload = self.wire.build_payload(
            &self.model,
            conversation,
            &options.without_tools(),
            true,
        );
        info!(provider = self.wire.provider(), model = %self.model, "chat stream request");
        let (response, prompt_elapsed) = self
            .http
            .post_blocking(self.wire.endpoint_path(), &payload)?;
        let aggregator = StreamAggregator::new(self.wire.stream_decoder(), prompt_elapsed);
        Ok(BlockingTextStream::new(
            Box::new(response),
            aggregator,
            conversation,
        ))
    }

    async fn astream<'a>(
        &'a self,
        conversation: &'a mut Conversation,
        options: &'a PredictOptions,
    ) -> Result<TextStream<'a>, PlexusError> {
        let options = self.effective_options(options);
        if options.toolkit.is_some() {
            let turn = self.complete(conversation, &options).await?;
            let round = Self::settle_tool_round(conversation, turn, &options)?;
            if let ToolRound::Answered(turn) = round {
                return Ok(TextStream::ready(
                    answered_fragments(&turn),
                    turn.usage,
                    conversation,
                ));
            }
        }

        let payload = self.wire.build_payload(
            &self.model,
            conversation,
            &options.without_tools(),
            true,
        );
        info!(provider = self.wire.provider(), model = %self.model, "chat stream request");
        let (response, prompt_elapsed) = self
            .http
            .post(self.wire.endpoint_path(), &payload)
            .await?;
        let aggregator = StreamAggregator::new(self.wire.stream_decoder(), prompt_elapsed);
        Ok(TextStream::new(response, aggregator, conversation))
    }
}
