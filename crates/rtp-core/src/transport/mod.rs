//! UDP transport for RTP and RTCP

mod udp;

pub use udp::{PacketChannel, RtpSocket, MAX_BIND_ATTEMPTS};
