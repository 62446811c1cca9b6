//! The signaling collaborator.
//!
//! SIP transactions, dialogs and SDP text live outside the core. Each user
//! agent owns one [`Signaling`] implementation. Operations go out through
//! the trait and return right away; everything the network reports comes
//! back as a [`SignalingEvent`] posted to the engine. SDP is already decoded
//! on both paths.

use rsua_media_core::{LocalMedia, RemoteMedia};
use tokio::sync::mpsc;

use crate::engine::LoopEvent;
use crate::errors::{CallError, Result};
use crate::types::{CallId, CustomHeader};

pub trait Signaling: Send {
    /// Send the initial offer to `target`
    fn connect(&mut self, call: &CallId, target: &str, offer: &[LocalMedia], headers: &[CustomHeader]) -> Result<()>;

    fn answer(&mut self, call: &CallId, code: u16, answer: &[LocalMedia]) -> Result<()>;

    /// Provisional response with early media
    fn progress(&mut self, call: &CallId, media: &[LocalMedia]) -> Result<()>;

    /// Re-offer within the established dialog
    fn modify(&mut self, call: &CallId, offer: &[LocalMedia]) -> Result<()>;

    /// End or reject the call; `code` is only meaningful before answer
    fn hangup(&mut self, call: &CallId, code: u16, reason: &str) -> Result<()>;

    /// Ask the peer to call `uri` instead of us
    fn refer(&mut self, call: &CallId, uri: &str) -> Result<()>;

    /// Report transfer progress to the party that asked for the transfer
    fn notify_sipfrag(&mut self, call: &CallId, code: u16, reason: &str) -> Result<()>;

    fn send_dtmf(&mut self, call: &CallId, key: char) -> Result<()>;
}

/// What the signaling layer reports about a call
#[derive(Debug, Clone)]
pub enum SignalingEvent {
    /// A new inbound call; `call` is the id the signaling layer assigned
    Incoming {
        call: CallId,
        from: String,
        media: Vec<RemoteMedia>,
    },
    Ringing {
        call: CallId,
    },
    Progress {
        call: CallId,
        media: Vec<RemoteMedia>,
    },
    /// The call was answered. `media` holds the answer, empty if none came
    Established {
        call: CallId,
        media: Vec<RemoteMedia>,
    },
    Closed {
        call: CallId,
        code: u16,
        reason: String,
    },
    /// The peer asked us to transfer the call to `uri`
    Transfer {
        call: CallId,
        uri: String,
    },
    TransferFailed {
        call: CallId,
        reason: String,
    },
    Dtmf {
        call: CallId,
        key: char,
    },
}

impl SignalingEvent {
    pub fn call(&self) -> &CallId {
        match self {
            SignalingEvent::Incoming { call, .. }
            | SignalingEvent::Ringing { call }
            | SignalingEvent::Progress { call, .. }
            | SignalingEvent::Established { call, .. }
            | SignalingEvent::Closed { call, .. }
            | SignalingEvent::Transfer { call, .. }
            | SignalingEvent::TransferFailed { call, .. }
            | SignalingEvent::Dtmf { call, .. } => call,
        }
    }
}

/// Handle a [`Signaling`] implementation uses to post events for its user
/// agent into the engine
#[derive(Debug, Clone)]
pub struct SignalingEventSender {
    aor: String,
    tx: mpsc::UnboundedSender<LoopEvent>,
}

impl SignalingEventSender {
    pub(crate) fn new(aor: impl Into<String>, tx: mpsc::UnboundedSender<LoopEvent>) -> Self {
        Self { aor: aor.into(), tx }
    }

    pub fn aor(&self) -> &str {
        &self.aor
    }

    pub fn send(&self, event: SignalingEvent) -> Result<()> {
        self.tx
            .send(LoopEvent::Signaling {
                aor: self.aor.clone(),
                event,
            })
            .map_err(|_| CallError::EngineStopped)
    }
}
