use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use bytes::Bytes;
use rsua_rtp_core::time::clock_rates;

use crate::error::MediaError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }

    pub fn default_clock_rate(&self) -> u32 {
        match self {
            MediaKind::Audio => clock_rates::AUDIO_8KHZ,
            MediaKind::Video => clock_rates::VIDEO_90KHZ,
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Media direction attribute of one side of a media line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MediaDirection {
    #[default]
    SendRecv,
    SendOnly,
    RecvOnly,
    Inactive,
}

impl MediaDirection {
    pub fn from_flags(send: bool, recv: bool) -> Self {
        match (send, recv) {
            (true, true) => MediaDirection::SendRecv,
            (true, false) => MediaDirection::SendOnly,
            (false, true) => MediaDirection::RecvOnly,
            (false, false) => MediaDirection::Inactive,
        }
    }

    pub fn can_send(&self) -> bool {
        matches!(self, MediaDirection::SendRecv | MediaDirection::SendOnly)
    }

    pub fn can_recv(&self) -> bool {
        matches!(self, MediaDirection::SendRecv | MediaDirection::RecvOnly)
    }

    /// Direction in effect for us given the peer's declared direction
    pub fn negotiate(&self, remote: MediaDirection) -> MediaDirection {
        MediaDirection::from_flags(self.can_send() && remote.can_recv(), self.can_recv() && remote.can_send())
    }

    /// The direction we offer while on hold: we may keep sending, never receive
    pub fn on_hold(&self) -> MediaDirection {
        MediaDirection::from_flags(self.can_send(), false)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MediaDirection::SendRecv => "sendrecv",
            MediaDirection::SendOnly => "sendonly",
            MediaDirection::RecvOnly => "recvonly",
            MediaDirection::Inactive => "inactive",
        }
    }
}

impl fmt::Display for MediaDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MediaDirection {
    type Err = MediaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sendrecv" => Ok(MediaDirection::SendRecv),
            "sendonly" => Ok(MediaDirection::SendOnly),
            "recvonly" => Ok(MediaDirection::RecvOnly),
            "inactive" => Ok(MediaDirection::Inactive),
            other => Err(MediaError::InvalidInput(format!("unknown media direction '{}'", other))),
        }
    }
}

/// Non-owning back-reference from a stream to its owner: the call id and the
/// media-line position of the stream within that call
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamTag {
    pub owner: String,
    pub index: usize,
}

impl StreamTag {
    pub fn new(owner: impl Into<String>, index: usize) -> Self {
        Self { owner: owner.into(), index }
    }
}

impl fmt::Display for StreamTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.owner, self.index)
    }
}

/// What we put in our offer or answer for one media line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalMedia {
    pub kind: MediaKind,
    pub rtp_addr: SocketAddr,
    pub rtcp_addr: SocketAddr,
    pub payload_type: u8,
    pub rtcp_mux: bool,
    pub direction: MediaDirection,
    /// Transport protocol tag, e.g. `RTP/AVP` or the encryption's tag
    pub proto: String,
}

/// The peer's decoded description of one media line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteMedia {
    pub kind: MediaKind,
    /// `None` while the peer has not provided a usable address
    pub rtp_addr: Option<SocketAddr>,
    pub rtcp_addr: Option<SocketAddr>,
    pub payload_type: u8,
    pub rtcp_mux: bool,
    pub direction: MediaDirection,
}

impl RemoteMedia {
    pub fn new(kind: MediaKind, rtp_addr: SocketAddr, payload_type: u8) -> Self {
        Self {
            kind,
            rtp_addr: Some(rtp_addr),
            rtcp_addr: None,
            payload_type,
            rtcp_mux: false,
            direction: MediaDirection::SendRecv,
        }
    }

    pub fn with_direction(mut self, direction: MediaDirection) -> Self {
        self.direction = direction;
        self
    }

    pub fn with_rtcp_mux(mut self, rtcp_mux: bool) -> Self {
        self.rtcp_mux = rtcp_mux;
        self
    }
}

/// One unit of media between a device and a stream. For video, `data` is a
/// whole Annex-B access unit on the way out and one RTP payload on the way in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaFrame {
    pub timestamp: u32,
    pub marker: bool,
    pub data: Bytes,
}

impl MediaFrame {
    pub fn new(timestamp: u32, data: impl Into<Bytes>) -> Self {
        Self {
            timestamp,
            marker: false,
            data: data.into(),
        }
    }

    pub fn with_marker(mut self, marker: bool) -> Self {
        self.marker = marker;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_negotiation() {
        use MediaDirection::*;
        assert_eq!(SendRecv.negotiate(SendRecv), SendRecv);
        assert_eq!(SendRecv.negotiate(SendOnly), RecvOnly);
        assert_eq!(SendRecv.negotiate(RecvOnly), SendOnly);
        assert_eq!(SendOnly.negotiate(SendOnly), Inactive);
        assert_eq!(RecvOnly.negotiate(Inactive), Inactive);
    }

    #[test]
    fn test_hold_direction() {
        assert_eq!(MediaDirection::SendRecv.on_hold(), MediaDirection::SendOnly);
        assert_eq!(MediaDirection::RecvOnly.on_hold(), MediaDirection::Inactive);
    }

    #[test]
    fn test_direction_parse() {
        assert_eq!("SendOnly".parse::<MediaDirection>().unwrap(), MediaDirection::SendOnly);
        assert!(matches!("sideways".parse::<MediaDirection>(), Err(MediaError::InvalidInput(_))));
    }
}
