//! Shared helpers for session-core integration tests

#![allow(dead_code)]

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use parking_lot::Mutex;
use rsua_infra_common::ConfMap;
use rsua_media_core::{LocalMedia, MediaDirection, MediaKind, RemoteMedia};
use rsua_session_core::{
    CallError, CallId, CustomHeader, Engine, Result, Signaling, UaConfig, UaEvent, UaEventReceiver,
};

pub const ALICE: &str = "sip:alice@example.com";
pub const BOB: &str = "sip:bob@example.com";
pub const CAROL: &str = "sip:carol@example.com";

/// What the engine asked the signaling layer to do
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Connect { call: CallId, target: String, media: Vec<LocalMedia> },
    Answer { call: CallId, code: u16, media: Vec<LocalMedia> },
    Progress { call: CallId },
    Modify { call: CallId, media: Vec<LocalMedia> },
    Hangup { call: CallId, code: u16, reason: String },
    Refer { call: CallId, uri: String },
    Sipfrag { call: CallId, code: u16, reason: String },
    Dtmf { call: CallId, key: char },
}

#[derive(Default)]
struct State {
    ops: Vec<Op>,
    fail_targets: Vec<String>,
    fail_modify: bool,
}

/// Signaling layer that records every operation. Clones share the log.
#[derive(Clone, Default)]
pub struct MockSignaling {
    state: Arc<Mutex<State>>,
}

impl MockSignaling {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse connects to `target`
    pub fn fail_connect_to(&self, target: &str) {
        self.state.lock().fail_targets.push(target.to_string());
    }

    pub fn fail_modify(&self, fail: bool) {
        self.state.lock().fail_modify = fail;
    }

    pub fn ops(&self) -> Vec<Op> {
        self.state.lock().ops.clone()
    }

    pub fn clear(&self) {
        self.state.lock().ops.clear();
    }

    pub fn connects(&self) -> Vec<(CallId, String)> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                Op::Connect { call, target, .. } => Some((call, target)),
                _ => None,
            })
            .collect()
    }

    pub fn hangups(&self) -> Vec<(CallId, u16, String)> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                Op::Hangup { call, code, reason } => Some((call, code, reason)),
                _ => None,
            })
            .collect()
    }

    pub fn sipfrags(&self) -> Vec<(CallId, u16, String)> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                Op::Sipfrag { call, code, reason } => Some((call, code, reason)),
                _ => None,
            })
            .collect()
    }

    fn record(&self, op: Op) {
        self.state.lock().ops.push(op);
    }
}

impl Signaling for MockSignaling {
    fn connect(&mut self, call: &CallId, target: &str, offer: &[LocalMedia], _headers: &[CustomHeader]) -> Result<()> {
        if self.state.lock().fail_targets.iter().any(|t| t == target) {
            return Err(CallError::signaling(format!("no route to {}", target)));
        }
        self.record(Op::Connect {
            call: call.clone(),
            target: target.to_string(),
            media: offer.to_vec(),
        });
        Ok(())
    }

    fn answer(&mut self, call: &CallId, code: u16, answer: &[LocalMedia]) -> Result<()> {
        self.record(Op::Answer {
            call: call.clone(),
            code,
            media: answer.to_vec(),
        });
        Ok(())
    }

    fn progress(&mut self, call: &CallId, _media: &[LocalMedia]) -> Result<()> {
        self.record(Op::Progress { call: call.clone() });
        Ok(())
    }

    fn modify(&mut self, call: &CallId, offer: &[LocalMedia]) -> Result<()> {
        if self.state.lock().fail_modify {
            return Err(CallError::signaling("488 Not Acceptable Here"));
        }
        self.record(Op::Modify {
            call: call.clone(),
            media: offer.to_vec(),
        });
        Ok(())
    }

    fn hangup(&mut self, call: &CallId, code: u16, reason: &str) -> Result<()> {
        self.record(Op::Hangup {
            call: call.clone(),
            code,
            reason: reason.to_string(),
        });
        Ok(())
    }

    fn refer(&mut self, call: &CallId, uri: &str) -> Result<()> {
        self.record(Op::Refer {
            call: call.clone(),
            uri: uri.to_string(),
        });
        Ok(())
    }

    fn notify_sipfrag(&mut self, call: &CallId, code: u16, reason: &str) -> Result<()> {
        self.record(Op::Sipfrag {
            call: call.clone(),
            code,
            reason: reason.to_string(),
        });
        Ok(())
    }

    fn send_dtmf(&mut self, call: &CallId, key: char) -> Result<()> {
        self.record(Op::Dtmf { call: call.clone(), key });
        Ok(())
    }
}

/// Configuration that binds media on loopback with OS-assigned ports
pub fn test_conf() -> ConfMap {
    ConfMap::new()
        .with("rtp_ports", "0-0")
        .with("media_laddr", "127.0.0.1")
}

/// An engine with Alice's user agent on a recording signaling layer
pub fn engine_with(conf: ConfMap) -> (Engine, MockSignaling) {
    let mut engine = Engine::from_conf(&conf);
    let signaling = MockSignaling::new();
    engine
        .add_user_agent(UaConfig::new(ALICE), Box::new(signaling.clone()))
        .unwrap();
    (engine, signaling)
}

pub fn engine() -> (Engine, MockSignaling) {
    engine_with(test_conf())
}

pub fn remote_audio(port: u16) -> RemoteMedia {
    RemoteMedia::new(
        MediaKind::Audio,
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port),
        0,
    )
}

pub fn remote_video(port: u16) -> RemoteMedia {
    RemoteMedia::new(
        MediaKind::Video,
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port),
        96,
    )
}

pub fn directions(media: &[LocalMedia]) -> Vec<MediaDirection> {
    media.iter().map(|m| m.direction).collect()
}

/// Everything published so far
pub fn drain(rx: &mut UaEventReceiver) -> Vec<UaEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
