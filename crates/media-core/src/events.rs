use std::net::SocketAddr;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::menc::MencEvent;
use crate::types::StreamTag;

/// Everything the media plane reports back to the event loop
#[derive(Debug, Clone)]
pub enum MediaEvent {
    Rtp {
        tag: StreamTag,
        data: Bytes,
        src: SocketAddr,
    },
    Rtcp {
        tag: StreamTag,
        data: Bytes,
        src: SocketAddr,
    },
    /// The stream's RTP-timeout timer fired
    RtpTimeout {
        tag: StreamTag,
        generation: u64,
    },
    /// A NAT-traversal media reached connectivity; addresses are the
    /// selected remote candidates, if the strategy learned any
    MnatConnected {
        tag: StreamTag,
        rtp_addr: Option<SocketAddr>,
        rtcp_addr: Option<SocketAddr>,
    },
    MnatSessionFailed {
        owner: String,
        reason: String,
    },
    Menc {
        tag: StreamTag,
        event: MencEvent,
        param: String,
    },
    MencError {
        tag: StreamTag,
        reason: String,
    },
    MencSessionFailed {
        owner: String,
        reason: String,
    },
}

impl MediaEvent {
    /// Call id of the stream or session the event belongs to
    pub fn owner(&self) -> &str {
        match self {
            MediaEvent::Rtp { tag, .. }
            | MediaEvent::Rtcp { tag, .. }
            | MediaEvent::RtpTimeout { tag, .. }
            | MediaEvent::MnatConnected { tag, .. }
            | MediaEvent::Menc { tag, .. }
            | MediaEvent::MencError { tag, .. } => &tag.owner,
            MediaEvent::MnatSessionFailed { owner, .. } | MediaEvent::MencSessionFailed { owner, .. } => owner,
        }
    }
}

pub type MediaEventSender = mpsc::UnboundedSender<MediaEvent>;
