use thiserror::Error;

pub type Result<T> = std::result::Result<T, MediaError>;

/// Media-plane errors, grouped by how the call layer has to react
#[derive(Debug, Error, Clone)]
pub enum MediaError {
    /// Transport or buffer allocation failed; fatal to the stream
    #[error("Resource exhaustion: {0}")]
    ResourceExhaustion(String),

    /// NAT traversal or encryption handshake failed
    #[error("Protocol negotiation failed: {0}")]
    ProtocolNegotiation(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("RTP error: {0}")]
    Rtp(#[from] rsua_rtp_core::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MediaError::ProtocolNegotiation("ICE failed".into());
        assert_eq!(err.to_string(), "Protocol negotiation failed: ICE failed");

        let rtp: MediaError = rsua_rtp_core::Error::InvalidPacket("short".into()).into();
        assert!(rtp.to_string().starts_with("RTP error:"));
    }
}
