//! Media NAT-traversal strategies (ICE, STUN, TURN and the like).
//!
//! A strategy creates one [`MnatSession`] per call. The session hands out a
//! [`MnatMedia`] for every stream of that call. When the strategy declares
//! [`MediaNat::wait_connected`], the stream holds back outbound media until
//! the media's [`MnatNotifier::connected`] has been called.

use std::net::SocketAddr;

use tracing::debug;

use crate::error::Result;
use crate::events::{MediaEvent, MediaEventSender};
use crate::registry::{Named, Registry};
use crate::types::{MediaKind, RemoteMedia, StreamTag};

pub trait MediaNat: Named + Send + Sync {
    /// Whether media must wait for the connected callback
    fn wait_connected(&self) -> bool;

    fn new_session(&self, owner: &str, offerer: bool, notifier: MnatSessionNotifier) -> Result<Box<dyn MnatSession>>;
}

pub trait MnatSession: Send {
    fn new_media(
        &mut self,
        kind: MediaKind,
        rtp_addr: SocketAddr,
        rtcp_addr: SocketAddr,
        notifier: MnatNotifier,
    ) -> Result<Box<dyn MnatMedia>>;

    /// Called after a new remote description was applied
    fn update(&mut self) -> Result<()> {
        Ok(())
    }
}

pub trait MnatMedia: Send {
    fn remote_update(&mut self, _remote: &RemoteMedia) {}
}

pub type MnatRegistry = Registry<dyn MediaNat>;

/// Handle a NAT media uses to report connectivity for its stream
#[derive(Debug, Clone)]
pub struct MnatNotifier {
    tag: StreamTag,
    tx: MediaEventSender,
}

impl MnatNotifier {
    pub(crate) fn new(tag: StreamTag, tx: MediaEventSender) -> Self {
        Self { tag, tx }
    }

    pub fn connected(&self, rtp_addr: Option<SocketAddr>, rtcp_addr: Option<SocketAddr>) {
        debug!(stream = %self.tag, "mnat connected");
        let _ = self.tx.send(MediaEvent::MnatConnected {
            tag: self.tag.clone(),
            rtp_addr,
            rtcp_addr,
        });
    }
}

/// Handle a NAT session uses to report that the call-wide handshake failed
#[derive(Debug, Clone)]
pub struct MnatSessionNotifier {
    owner: String,
    tx: MediaEventSender,
}

impl MnatSessionNotifier {
    pub fn new(owner: impl Into<String>, tx: MediaEventSender) -> Self {
        Self { owner: owner.into(), tx }
    }

    pub fn failed(&self, reason: impl Into<String>) {
        let _ = self.tx.send(MediaEvent::MnatSessionFailed {
            owner: self.owner.clone(),
            reason: reason.into(),
        });
    }
}
