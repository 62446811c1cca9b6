//! Media encryption strategies (SRTP, DTLS-SRTP, ZRTP and the like).
//!
//! Shaped like [`crate::mnat`]: one [`MencSession`] per call and one
//! [`MencMedia`] per stream. A strategy that declares
//! [`MediaEncryption::wait_secure`] keeps its streams silent until it
//! reports [`MencEvent::Secure`].

use std::fmt;
use std::net::SocketAddr;

use bytes::BytesMut;

use crate::error::Result;
use crate::events::{MediaEvent, MediaEventSender};
use crate::registry::{Named, Registry};
use crate::types::{MediaKind, StreamTag};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MencEvent {
    Secure,
    VerifyRequest,
    PeerVerified,
}

impl fmt::Display for MencEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MencEvent::Secure => "secure",
            MencEvent::VerifyRequest => "verify-request",
            MencEvent::PeerVerified => "peer-verified",
        })
    }
}

pub trait MediaEncryption: Named + Send + Sync {
    /// Transport protocol tag placed in our media descriptions
    fn sdp_proto(&self) -> &str;

    fn wait_secure(&self) -> bool;

    fn new_session(&self, owner: &str, offerer: bool, notifier: MencSessionNotifier) -> Result<Box<dyn MencSession>>;
}

pub trait MencSession: Send {
    fn new_media(&mut self, kind: MediaKind, local: SocketAddr, notifier: MencNotifier) -> Result<Box<dyn MencMedia>>;
}

/// Per-stream encryption state. The default transforms leave packets as is.
pub trait MencMedia: Send {
    fn protect_rtp(&mut self, _packet: &mut BytesMut) -> Result<()> {
        Ok(())
    }

    fn unprotect_rtp(&mut self, _packet: &mut BytesMut) -> Result<()> {
        Ok(())
    }
}

pub type MencRegistry = Registry<dyn MediaEncryption>;

/// Handle an encryption media uses to report events for its stream
#[derive(Debug, Clone)]
pub struct MencNotifier {
    tag: StreamTag,
    tx: MediaEventSender,
}

impl MencNotifier {
    pub(crate) fn new(tag: StreamTag, tx: MediaEventSender) -> Self {
        Self { tag, tx }
    }

    pub fn event(&self, event: MencEvent, param: impl Into<String>) {
        let _ = self.tx.send(MediaEvent::Menc {
            tag: self.tag.clone(),
            event,
            param: param.into(),
        });
    }

    pub fn error(&self, reason: impl Into<String>) {
        let _ = self.tx.send(MediaEvent::MencError {
            tag: self.tag.clone(),
            reason: reason.into(),
        });
    }
}

#[derive(Debug, Clone)]
pub struct MencSessionNotifier {
    owner: String,
    tx: MediaEventSender,
}

impl MencSessionNotifier {
    pub fn new(owner: impl Into<String>, tx: MediaEventSender) -> Self {
        Self { owner: owner.into(), tx }
    }

    pub fn failed(&self, reason: impl Into<String>) {
        let _ = self.tx.send(MediaEvent::MencSessionFailed {
            owner: self.owner.clone(),
            reason: reason.into(),
        });
    }
}
