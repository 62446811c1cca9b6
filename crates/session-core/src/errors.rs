//! Error types for session-core
//!
//! Every error maps onto one of five [`ErrorKind`]s, which is what
//! programmatic consumers act on. The message is for people.

use std::fmt;

use rsua_media_core::MediaError;
use thiserror::Error;

use crate::types::CallState;

/// Main result type for call operations
pub type Result<T> = std::result::Result<T, CallError>;

#[derive(Debug, Error, Clone)]
pub enum CallError {
    /// Allocation or transport setup failed
    #[error("Resource exhaustion: {0}")]
    ResourceExhaustion(String),

    /// NAT traversal or encryption handshake failed
    #[error("Protocol negotiation failed: {0}")]
    ProtocolNegotiation(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    /// Malformed dial target, DTMF key or direction
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Cannot {operation} a call in state {state}")]
    InvalidState { operation: &'static str, state: CallState },

    /// The signaling collaborator refused an operation
    #[error("Signaling error: {0}")]
    Signaling(String),

    #[error("Call not found: {0}")]
    CallNotFound(String),

    #[error("User agent not found: {0}")]
    UserAgentNotFound(String),

    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    /// The event loop is no longer running
    #[error("Engine stopped")]
    EngineStopped,
}

/// Coarse error classes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ErrorKind {
    ResourceExhaustion,
    ProtocolNegotiation,
    Timeout,
    InvalidInput,
    Unsupported,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ResourceExhaustion => write!(f, "resource exhaustion"),
            Self::ProtocolNegotiation => write!(f, "protocol negotiation"),
            Self::Timeout => write!(f, "timeout"),
            Self::InvalidInput => write!(f, "invalid input"),
            Self::Unsupported => write!(f, "unsupported"),
        }
    }
}

impl CallError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ResourceExhaustion(_) | Self::EngineStopped => ErrorKind::ResourceExhaustion,
            Self::ProtocolNegotiation(_) | Self::Signaling(_) => ErrorKind::ProtocolNegotiation,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::InvalidInput(_)
            | Self::InvalidState { .. }
            | Self::CallNotFound(_)
            | Self::UserAgentNotFound(_) => ErrorKind::InvalidInput,
            Self::Unsupported(_) => ErrorKind::Unsupported,
            Self::Media(err) => media_kind(err),
        }
    }

    pub fn signaling(msg: impl Into<String>) -> Self {
        Self::Signaling(msg.into())
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }
}

pub(crate) fn media_kind(err: &MediaError) -> ErrorKind {
    match err {
        MediaError::ResourceExhaustion(_) | MediaError::Rtp(_) => ErrorKind::ResourceExhaustion,
        MediaError::ProtocolNegotiation(_) => ErrorKind::ProtocolNegotiation,
        MediaError::Timeout(_) => ErrorKind::Timeout,
        MediaError::InvalidInput(_) => ErrorKind::InvalidInput,
        MediaError::Unsupported(_) => ErrorKind::Unsupported,
    }
}
