//! RTP building blocks for rsua.
//!
//! - `packet`: RTP header/packet codec and RTCP demultiplexing
//! - `payload::h264`: H.264 Annex-B to RTP packetization (RFC 6184)
//! - `stats`: receive-side sequence tracking and traffic metrics
//! - `transport`: UDP socket pairs bound inside a port range
//! - `time`: RTP clock conversions

mod error;

pub mod packet;
pub mod payload;
pub mod stats;
pub mod time;
pub mod transport;

pub use error::Error;
pub use packet::{RtpHeader, RtpPacket, is_rtcp_packet};
pub use stats::{Metric, SeqResult, SequenceTracker};
pub use transport::{PacketChannel, RtpSocket};

/// The default maximum size for RTP packets in bytes
pub const DEFAULT_MAX_PACKET_SIZE: usize = 1500;

pub type RtpTimestamp = u32;

pub type RtpSequenceNumber = u16;

pub type RtpSsrc = u32;

pub type RtpCsrc = u32;

pub type Result<T> = std::result::Result<T, Error>;
