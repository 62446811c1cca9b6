//! Events published to subscribers (UI, applications, tests)

use rsua_media_core::MencEvent;
use tokio::sync::broadcast;

use crate::errors::ErrorKind;
use crate::types::{CallDirection, CallId};

#[derive(Debug, Clone, PartialEq)]
pub enum UaEvent {
    CallIncoming {
        call: CallId,
        aor: String,
        peer: String,
    },
    CallOutgoing {
        call: CallId,
        aor: String,
        peer: String,
    },
    CallRinging {
        call: CallId,
    },
    CallProgress {
        call: CallId,
    },
    CallEstablished {
        call: CallId,
        peer: String,
    },
    /// Published after the call's media has been released
    CallClosed {
        call: CallId,
        aor: String,
        direction: CallDirection,
        code: u16,
        reason: String,
    },
    CallTransfer {
        call: CallId,
        uri: String,
    },
    CallTransferFailed {
        call: CallId,
        reason: String,
    },
    /// A non-fatal error on one of the call's streams or sessions
    CallError {
        call: CallId,
        kind: ErrorKind,
        reason: String,
    },
    /// First RTP packet received on a stream
    RtpEstablished {
        call: CallId,
        index: usize,
    },
    MediaEncryption {
        call: CallId,
        event: MencEvent,
        param: String,
    },
    Dtmf {
        call: CallId,
        key: char,
    },
    /// A redial has been scheduled
    Redialing {
        attempt: u32,
        target: String,
    },
    Shutdown,
}

impl UaEvent {
    pub fn call(&self) -> Option<&CallId> {
        match self {
            UaEvent::CallIncoming { call, .. }
            | UaEvent::CallOutgoing { call, .. }
            | UaEvent::CallRinging { call }
            | UaEvent::CallProgress { call }
            | UaEvent::CallEstablished { call, .. }
            | UaEvent::CallClosed { call, .. }
            | UaEvent::CallTransfer { call, .. }
            | UaEvent::CallTransferFailed { call, .. }
            | UaEvent::CallError { call, .. }
            | UaEvent::RtpEstablished { call, .. }
            | UaEvent::MediaEncryption { call, .. }
            | UaEvent::Dtmf { call, .. } => Some(call),
            UaEvent::Redialing { .. } | UaEvent::Shutdown => None,
        }
    }
}

/// Capacity of the subscriber channel; slow subscribers lose the oldest events
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

pub type UaEventReceiver = broadcast::Receiver<UaEvent>;
