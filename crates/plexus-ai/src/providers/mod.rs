use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::adapter::{AdapterConfig, ProviderAdapter};
use crate::error::{PlexusError, PlexusErrorCode};

mod chat;
mod cohere;
mod common;
mod fal_image;
mod openai_chat;

pub use chat::{ChatAdapter, ChatCompletion, ChatWireFormat};
pub use cohere::{CohereChat, CohereChatAdapter};
pub use fal_image::{FalImageAdapter, FAL_CREDENTIAL_ENV};
pub use openai_chat::{OpenAiChat, OpenAiChatAdapter};

/// The backends this crate ships adapters for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    Groq,
    Deepseek,
    Cohere,
    FalImage,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 4] = [
        ProviderKind::Groq,
        ProviderKind::Deepseek,
        ProviderKind::Cohere,
        ProviderKind::FalImage,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Groq => "groq",
            ProviderKind::Deepseek => "deepseek",
            ProviderKind::Cohere => "cohere",
            ProviderKind::FalImage => "fal-image",
        }
    }

    pub fn default_config(&self) -> AdapterConfig {
        match self {
            ProviderKind::Groq => AdapterConfig::groq(),
            ProviderKind::Deepseek => AdapterConfig::deepseek(),
            ProviderKind::Cohere => AdapterConfig::cohere(),
            ProviderKind::FalImage => AdapterConfig::fal_image(),
        }
    }

    pub fn credential_env(&self) -> &'static str {
        match self {
            ProviderKind::Groq => "GROQ_API_KEY",
            ProviderKind::Deepseek => "DEEPSEEK_API_KEY",
            ProviderKind::Cohere => "COHERE_API_KEY",
            ProviderKind::FalImage => FAL_CREDENTIAL_ENV,
        }
    }
}

impl Display for ProviderKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = PlexusError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase();
        ProviderKind::ALL
            .into_iter()
            .find(|kind| {
                kind.as_str() == normalized
                    || (normalized == "fal" && *kind == ProviderKind::FalImage)
            })
            .ok_or_else(|| {
                PlexusError::new(
                    PlexusErrorCode::ConfigurationInvalid,
                    format!("Unknown provider '{value}'"),
                )
                .with_details(json!({
                    "provider": value,
                    "knownProviders": ProviderKind::ALL.map(|kind| kind.as_str()),
                }))
            })
    }
}

pub fn build_adapter(
    kind: ProviderKind,
    config: AdapterConfig,
) -> Result<Box<dyn ProviderAdapter>, PlexusError> {
    let adapter: Box<dyn ProviderAdapter> = match kind {
        ProviderKind::Groq => Box::new(OpenAiChatAdapter::groq(config)?),
        ProviderKind::Deepseek => Box::new(OpenAiChatAdapter::deepseek(config)?),
        ProviderKind::Cohere => Box::new(CohereChatAdapter::cohere(config)?),
        ProviderKind::FalImage => Box::new(FalImageAdapter::new(config)?),
    };
    Ok(adapter)
}
