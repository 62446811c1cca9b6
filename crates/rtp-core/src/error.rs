use std::io;
use thiserror::Error;

/// Error type for RTP operations
#[derive(Debug, Error, Clone)]
pub enum Error {
    #[error("Invalid RTP packet format: {0}")]
    InvalidPacket(String),

    #[error("Buffer too small for RTP packet: need {required} but have {available}")]
    BufferTooSmall { required: usize, available: usize },

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("Transport error: {0}")]
    Transport(String),

    /// No free port (pair) could be bound inside the configured range
    #[error("No free RTP port in range {min}-{max}")]
    PortRangeExhausted { min: u16, max: u16 },

    /// The packet sink refused one or more fragments of an access unit
    #[error("Packetization failed: {0}")]
    Packetization(String),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::IoError(err.to_string())
    }
}
