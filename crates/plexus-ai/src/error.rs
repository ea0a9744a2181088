use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlexusErrorCode {
    ConfigurationInvalid,
    ProviderAuthMissing,
    ProviderHttp,
    ProviderTransport,
    ProviderProtocol,
    ToolNotFound,
    ToolArgumentsInvalid,
    ToolExecutionFailed,
    SchemaInvalid,
    JobUnexpectedStatus,
    JobPollTimeout,
}

impl PlexusErrorCode {
    /// Raised while constructing an adapter; never worth retrying.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::ConfigurationInvalid | Self::ProviderAuthMissing)
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, Self::ProviderHttp | Self::ProviderTransport)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlexusError {
    pub code: PlexusErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl PlexusError {
    pub fn new(code: PlexusErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn is_configuration(&self) -> bool {
        self.code.is_configuration()
    }

    pub fn is_transport(&self) -> bool {
        self.code.is_transport()
    }

    /// HTTP status recorded for `ProviderHttp` failures.
    pub fn http_status(&self) -> Option<u16> {
        self.details
            .as_ref()
            .and_then(|details| details.get("status"))
            .and_then(Value::as_u64)
            .and_then(|status| u16::try_from(status).ok())
    }

    pub fn detail_str(&self, key: &str) -> Option<&str> {
        self.details
            .as_ref()
            .and_then(|details| details.get(key))
            .and_then(Value::as_str)
    }

    pub fn as_compact_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                "{{\"code\":\"provider_protocol\",\"message\":\"{}\"}}",
                self.message.replace('\"', "\\\"")
            )
        })
    }
}

impl Display for PlexusError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

impl std::error::Error for PlexusError {}
