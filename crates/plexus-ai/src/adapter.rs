use std::env;
use std::fmt::{Debug, Formatter};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::batch::BatchScheduler;
use crate::error::{PlexusError, PlexusErrorCode};
use crate::stream::{BlockingTextStream, TextStream};
use crate::types::{Conversation, PredictOptions};

pub const DEFAULT_MAX_CONCURRENT: usize = 5;

pub const GROQ_BASE_URL: &str = "https://api.groq.com/openai/v1";
pub const DEEPSEEK_BASE_URL: &str = "https://api.deepseek.com";
pub const COHERE_BASE_URL: &str = "https://api.cohere.ai/v1";
pub const FAL_QUEUE_BASE_URL: &str = "https://queue.fal.run";

/// Static per-backend data: which models may be used, where to send requests,
/// and an optional explicit credential.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterConfig {
    pub allowed_models: Vec<String>,
    pub default_model: String,
    pub base_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

impl AdapterConfig {
    pub fn new(
        allowed_models: impl IntoIterator<Item = impl Into<String>>,
        default_model: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            allowed_models: allowed_models.into_iter().map(Into::into).collect(),
            default_model: default_model.into(),
            base_url: base_url.into(),
            api_key: None,
        }
    }

    pub fn groq() -> Self {
        Self::new(
            [
                "llama3-8b-8192",
                "llama3-70b-8192",
                "llama3-groq-70b-8192-tool-use-preview",
                "llama3-groq-8b-8192-tool-use-preview",
                "llama-3.1-70b-versatile",
                "llama-3.1-8b-instant",
            ],
            "llama3-groq-70b-8192-tool-use-preview",
            GROQ_BASE_URL,
        )
    }

    pub fn deepseek() -> Self {
        Self::new(["deepseek-chat", "deepseek-coder"], "deepseek-chat", DEEPSEEK_BASE_URL)
    }

    pub fn cohere() -> Self {
        Self::new(
            [
                "command",
                "command-r-plus-08-2024",
                "command-r-plus-04-2024",
                "command-r-03-2024",
                "command-r-08-2024",
                "command-light",
            ],
            "command",
            COHERE_BASE_URL,
        )
    }

    pub fn fal_image() -> Self {
        Self::new(
            ["fal-ai/flux-pro", "fal-ai/flux-pro/new", "fal-ai/flux-pro/v1.1"],
            "fal-ai/flux-pro",
            FAL_QUEUE_BASE_URL,
        )
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Fails fast on an empty model set, a default model outside it, or a
    /// credential that is neither configured nor present in `credential_env`.
    pub fn validated(&self, credential_env: &str) -> Result<ResolvedConfig, PlexusError> {
        if self.allowed_models.is_empty() {
            return Err(PlexusError::new(
                PlexusErrorCode::ConfigurationInvalid,
                "allowed model set is empty",
            ));
        }
        if !self.allowed_models.contains(&self.default_model) {
            return Err(PlexusError::new(
                PlexusErrorCode::ConfigurationInvalid,
                format!("Model '{}' is not supported", self.default_model),
            )
            .with_details(json!({
                "model": self.default_model,
                "allowedModels": self.allowed_models,
            })));
        }
        if self.base_url.trim().is_empty() {
            return Err(PlexusError::new(
                PlexusErrorCode::ConfigurationInvalid,
                "base URL is empty",
            ));
        }

        let api_key = resolve_api_key(self.api_key.as_deref(), credential_env)?;
        Ok(ResolvedConfig {
            model: self.default_model.clone(),
            base_url: self.base_url.clone(),
            api_key,
        })
    }
}

impl Debug for AdapterConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterConfig")
            .field("allowed_models", &self.allowed_models)
            .field("default_model", &self.default_model)
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Output of [`AdapterConfig::validated`]; always carries a credential.
#[derive(Clone)]
pub struct ResolvedConfig {
    pub model: String,
    pub base_url: String,
    pub api_key: String,
}

impl Debug for ResolvedConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedConfig")
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

fn resolve_api_key(explicit: Option<&str>, credential_env: &str) -> Result<String, PlexusError> {
    if let Some(api_key) = explicit {
        if !api_key.trim().is_empty() {
            return Ok(api_key.to_string());
        }
    }

    if let Ok(value) = env::var(credential_env) {
        if !value.trim().is_empty() {
            return Ok(value);
        }
    }

    Err(PlexusError::new(
        PlexusErrorCode::ProviderAuthMissing,
        format!("Missing API key. Pass one explicitly or set {credential_env}."),
    )
    .with_details(json!({ "env": credential_env })))
}

/// Uniform calling surface over one backend.
///
/// Each call appends to the caller's conversation in place. On failure the
/// messages appended before the error remain.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn provider(&self) -> &str;

    fn model(&self) -> &str;

    /// Appends exactly one assistant message, followed by one tool message per
    /// requested tool call.
    fn predict(
        &self,
        conversation: &mut Conversation,
        options: &PredictOptions,
    ) -> Result<(), PlexusError>;

    async fn apredict(
        &self,
        conversation: &mut Conversation,
        options: &PredictOptions,
    ) -> Result<(), PlexusError>;

    fn stream<'a>(
        &'a self,
        conversation: &'a mut Conversation,
        options: &PredictOptions,
    ) -> Result<BlockingTextStream<'a>, PlexusError>;

    async fn astream<'a>(
        &'a self,
        conversation: &'a mut Conversation,
        options: &'a PredictOptions,
    ) -> Result<TextStream<'a>, PlexusError>;

    /// Sequential `predict` over every conversation; stops at the first error.
    fn batch(
        &self,
        conversations: Vec<Conversation>,
        options: &PredictOptions,
    ) -> Result<Vec<Conversation>, PlexusError> {
        let mut completed = Vec::with_capacity(conversations.len());
        for mut conversation in conversations {
            self.predict(&mut conversation, options)?;
            completed.push(conversation);
        }
        Ok(completed)
    }

    /// Concurrent `apredict` with at most `max_concurrent` calls in flight.
    /// Every conversation runs to completion; the first failure in input order
    /// is returned.
    async fn abatch(
        &self,
        conversations: Vec<Conversation>,
        options: &PredictOptions,
        max_concurrent: usize,
    ) -> Result<Vec<Conversation>, PlexusError> {
        self.abatch_outcomes(conversations, options, max_concurrent)
            .await
            .into_iter()
            .collect()
    }

    /// Like [`ProviderAdapter::abatch`], but reports each conversation's
    /// outcome separately.
    async fn abatch_outcomes(
        &self,
        conversations: Vec<Conversation>,
        options: &PredictOptions,
        max_concurrent: usize,
    ) -> Vec<Result<Conversation, PlexusError>> {
        BatchScheduler::new(max_concurrent)
            .run_all(conversations, |mut conversation| async move {
                self.apredict(&mut conversation, options).await?;
                Ok(conversation)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_model_must_be_allowed() {
        let error = AdapterConfig::groq()
            .with_model("gpt-4")
            .with_api_key("key")
            .validated("PLEXUS_TEST_UNUSED_KEY")
            .expect_err("unknown model should fail");

        assert_eq!(error.code, PlexusErrorCode::ConfigurationInvalid);
        assert!(error.is_configuration());
        assert_eq!(error.detail_str("model"), Some("gpt-4"));
    }

    #[test]
    fn empty_model_set_is_rejected() {
        let error = AdapterConfig::new(Vec::<String>::new(), "x", "http://localhost")
            .with_api_key("key")
            .validated("PLEXUS_TEST_UNUSED_KEY")
            .expect_err("empty set should fail");
        assert_eq!(error.code, PlexusErrorCode::ConfigurationInvalid);
    }

    #[test]
    fn missing_credential_is_a_configuration_error() {
        let error = AdapterConfig::cohere()
            .validated("PLEXUS_TEST_KEY_THAT_IS_NEVER_SET")
            .expect_err("missing key should fail");

        assert_eq!(error.code, PlexusErrorCode::ProviderAuthMissing);
        assert!(error.is_configuration());
        assert_eq!(error.detail_str("env"), Some("PLEXUS_TEST_KEY_THAT_IS_NEVER_SET"));
    }

    #[test]
    fn explicit_key_wins_and_is_redacted_in_debug() {
        let resolved = AdapterConfig::deepseek()
            .with_api_key("sk-secret")
            .validated("PLEXUS_TEST_UNUSED_KEY")
            .expect("config should validate");

        assert_eq!(resolved.model, "deepseek-chat");
        assert_eq!(resolved.api_key, "sk-secret");
        assert!(!format!("{resolved:?}").contains("sk-secret"));
        let config = AdapterConfig::groq().with_api_key("sk-secret");
        assert!(!format!("{config:?}").contains("sk-secret"));
    }

    #[test]
    fn presets_default_to_an_allowed_model() {
        for config in [
            AdapterConfig::groq(),
            AdapterConfig::deepseek(),
            AdapterConfig::cohere(),
            AdapterConfig::fal_image(),
        ] {
            assert!(config.allowed_models.contains(&config.default_model));
        }
    }
}
