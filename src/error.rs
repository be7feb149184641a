//! Error types for provider calls and conversation turns.

use thiserror::Error;
use uuid::Uuid;

use crate::models::ProviderId;

/// Result type for connector operations.
pub type ConnectorResult<T> = Result<T, ConnectorError>;

/// Errors raised by a provider connector. A successful call that produced no
/// text is `Ok(String::new())`, never one of these.
#[derive(Debug, Error)]
pub enum ConnectorError {
    /// Provider missing, disabled, or without credentials.
    #[error("{provider} is not configured: {reason}")]
    Configuration { provider: ProviderId, reason: String },

    /// The request could not be sent or the stream could not be read.
    #[error("Request failed: {0}")]
    Transport(String),

    /// Provider answered with a non-2xx status.
    #[error("API request failed with status {status}: {body}")]
    Http { status: u16, body: String },

    /// The stream was unreadable as a whole.
    #[error("Failed to decode response stream: {0}")]
    Decode(String),
}

impl ConnectorError {
    pub fn configuration(provider: ProviderId, reason: impl Into<String>) -> Self {
        Self::Configuration {
            provider,
            reason: reason.into(),
        }
    }

    /// Transport, HTTP and fatal decode failures are all reported the same way.
    pub fn is_transport(&self) -> bool {
        !matches!(self, ConnectorError::Configuration { .. })
    }
}

/// Errors that prevent a turn from starting or being recorded.
#[derive(Debug, Error)]
pub enum TurnError {
    #[error("Conversation {0} not found")]
    ConversationNotFound(Uuid),

    #[error("A reply is already streaming for conversation {0}")]
    Busy(Uuid),

    #[error("Message has neither text nor a screenshot")]
    EmptyMessage,

    #[error("Failed to prepare screenshot: {0:#}")]
    Image(anyhow::Error),

    #[error("Storage error: {0:#}")]
    Storage(anyhow::Error),
}
