//! Error types for the gateway.

use axum::http::StatusCode;
use thiserror::Error;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum GatewayError {
    #[error("Malformed request: {message}")]
    MalformedRequest { message: String },

    #[error("Invalid protocol version: {version}")]
    InvalidVersion { version: String },

    #[error("{component} is not configured")]
    NotConfigured { component: &'static str },

    #[error("Upstream error: {message}")]
    Upstream { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl GatewayError {
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedRequest {
            message: msg.into(),
        }
    }

    pub fn invalid_version(version: impl Into<String>) -> Self {
        Self::InvalidVersion {
            version: version.into(),
        }
    }

    pub fn upstream(msg: impl Into<String>) -> Self {
        Self::Upstream {
            message: msg.into(),
        }
    }

    /// Reclassify a collaborator failure so it always surfaces as an opaque 500.
    pub fn into_upstream(self) -> Self {
        match self {
            Self::Upstream { .. } => self,
            other => Self::upstream(other.to_string()),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// HTTP status returned to the caller for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::MalformedRequest { .. } | Self::InvalidVersion { .. } => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine-readable error type, shared by the OpenAI and Anthropic error bodies.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::MalformedRequest { .. } | Self::InvalidVersion { .. } => "invalid_request_error",
            _ => "api_error",
        }
    }

    /// Message safe to show to API consumers. Upstream and internal details stay in the logs.
    pub fn client_message(&self) -> String {
        match self {
            Self::MalformedRequest { .. } | Self::InvalidVersion { .. } | Self::NotConfigured { .. } => {
                self.to_string()
            }
            _ => "internal error".to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
