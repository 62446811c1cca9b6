//! A call and the streams it owns.
//!
//! [`Call`] holds the signaling state and exclusively owns its media streams,
//! indexed by media-line position. It never talks to the signaling layer or
//! to subscribers; the engine does that around it.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rsua_infra_common::Timer;
use rsua_media_core::{
    DeviceThread, LocalMedia, MediaDirection, MediaEncryption, MediaEventSender, MediaKind, MediaNat, MencSession,
    MencSessionNotifier, MnatSession, MnatSessionNotifier, RemoteMedia, Stream, StreamConfig, StreamParams, StreamTag,
};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::engine::LoopEvent;
use crate::errors::{CallError, Result};
use crate::types::{CallDirection, CallId, CallInfo, CallState, CustomHeader, VideoMode};

pub struct Call {
    id: CallId,
    aor: String,
    peer: String,
    state: CallState,
    direction: CallDirection,
    linenum: u32,
    headers: Vec<CustomHeader>,

    streams: Vec<Stream>,
    mnat: Option<(Arc<dyn MediaNat>, Box<dyn MnatSession>)>,
    menc: Option<(Arc<dyn MediaEncryption>, Box<dyn MencSession>)>,
    /// Capture threads feeding the streams
    devices: Vec<DeviceThread>,
    media_released: bool,

    local_timer: Timer,
    on_hold: bool,
    transferor: Option<CallId>,
    /// The signaling layer knows about this call
    signaled: bool,

    started_at: DateTime<Utc>,
    established_at: Option<DateTime<Utc>>,
    established: Option<Instant>,
}

impl Call {
    pub fn new(id: CallId, aor: impl Into<String>, peer: impl Into<String>, direction: CallDirection, linenum: u32) -> Self {
        Self {
            id,
            aor: aor.into(),
            peer: peer.into(),
            state: CallState::Idle,
            direction,
            linenum,
            headers: Vec::new(),
            streams: Vec::new(),
            mnat: None,
            menc: None,
            devices: Vec::new(),
            media_released: false,
            local_timer: Timer::new(),
            on_hold: false,
            transferor: None,
            signaled: false,
            started_at: Utc::now(),
            established_at: None,
            established: None,
        }
    }

    pub fn id(&self) -> &CallId {
        &self.id
    }

    pub fn aor(&self) -> &str {
        &self.aor
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn direction(&self) -> CallDirection {
        self.direction
    }

    pub fn linenum(&self) -> u32 {
        self.linenum
    }

    pub fn headers(&self) -> &[CustomHeader] {
        &self.headers
    }

    pub fn set_headers(&mut self, headers: Vec<CustomHeader>) {
        self.headers = headers;
    }

    pub fn transferor(&self) -> Option<&CallId> {
        self.transferor.as_ref()
    }

    pub fn set_transferor(&mut self, call: CallId) {
        self.transferor = Some(call);
    }

    pub fn is_signaled(&self) -> bool {
        self.signaled
    }

    pub(crate) fn mark_signaled(&mut self) {
        self.signaled = true;
    }

    pub fn is_on_hold(&self) -> bool {
        self.on_hold
    }

    /// Move to `next`. Re-entering the current state is a no-op and returns
    /// `Ok(false)`.
    pub fn set_state(&mut self, next: CallState) -> Result<bool> {
        if next == self.state {
            return Ok(false);
        }
        if !self.state.can_transition_to(next) {
            return Err(CallError::InvalidState {
                operation: transition_name(next),
                state: self.state,
            });
        }
        debug!(call_id = %self.id, "state {} -> {}", self.state, next);
        self.state = next;
        if next == CallState::Established {
            self.established_at = Some(Utc::now());
            self.established = Some(Instant::now());
            self.local_timer.cancel();
        }
        Ok(true)
    }

    /// Create the per-call NAT and encryption sessions and one stream per
    /// media line
    pub fn alloc_media(
        &mut self,
        cfg: &StreamConfig,
        laddr: IpAddr,
        video: VideoMode,
        mnat: Option<Arc<dyn MediaNat>>,
        menc: Option<Arc<dyn MediaEncryption>>,
        events: &MediaEventSender,
    ) -> Result<()> {
        let offerer = self.direction == CallDirection::Outgoing;
        let owner = self.id.as_str().to_string();

        if let Some(nat) = mnat {
            let session = nat.new_session(&owner, offerer, MnatSessionNotifier::new(owner.clone(), events.clone()))?;
            self.mnat = Some((nat, session));
        }
        if let Some(enc) = menc {
            let session = enc.new_session(&owner, offerer, MencSessionNotifier::new(owner.clone(), events.clone()))?;
            self.menc = Some((enc, session));
        }

        let kinds: &[MediaKind] = match video {
            VideoMode::On => &[MediaKind::Audio, MediaKind::Video],
            VideoMode::Off => &[MediaKind::Audio],
        };
        for (index, kind) in kinds.iter().enumerate() {
            let params = StreamParams::new(*kind, StreamTag::new(owner.clone(), index), laddr);
            let nat = self
                .mnat
                .as_mut()
                .map(|(nat, session)| (&**nat as &dyn MediaNat, &mut **session as &mut dyn MnatSession));
            let enc = self
                .menc
                .as_mut()
                .map(|(enc, session)| (&**enc as &dyn MediaEncryption, &mut **session as &mut dyn MencSession));
            let stream = Stream::alloc(params, cfg, nat, enc, events.clone())?;
            self.streams.push(stream);
        }
        Ok(())
    }

    pub fn streams(&self) -> &[Stream] {
        &self.streams
    }

    pub fn stream_mut(&mut self, index: usize) -> Option<&mut Stream> {
        self.streams.get_mut(index)
    }

    pub fn add_device(&mut self, device: DeviceThread) {
        debug!(call_id = %self.id, device = device.name(), "device attached");
        self.devices.push(device);
    }

    pub fn devices(&self) -> &[DeviceThread] {
        &self.devices
    }

    pub fn has_video(&self) -> bool {
        self.streams.iter().any(|s| s.kind() == MediaKind::Video)
    }

    /// Our offer or answer, one entry per stream
    pub fn local_media(&self) -> Result<Vec<LocalMedia>> {
        self.streams
            .iter()
            .map(|s| s.local_media().map_err(CallError::from))
            .collect()
    }

    /// Apply the peer's media descriptions to the matching streams
    pub fn apply_remote(&mut self, remote: &[RemoteMedia]) -> Result<()> {
        for media in remote {
            match self.streams.iter_mut().find(|s| s.kind() == media.kind) {
                Some(stream) => stream.update_remote(media)?,
                None => debug!(call_id = %self.id, "no {} stream for remote media", media.kind),
            }
        }
        if let Some((_, session)) = self.mnat.as_mut() {
            session.update()?;
        }
        Ok(())
    }

    pub fn start_streams(&mut self) {
        for stream in &mut self.streams {
            stream.start();
        }
    }

    /// Stop sending video without dropping the media line
    pub fn disable_video(&mut self) {
        for stream in self.streams.iter_mut().filter(|s| s.kind() == MediaKind::Video) {
            stream.set_ldir(MediaDirection::Inactive);
        }
    }

    /// Put every stream on hold or take it off. Returns `false` if the call
    /// already was in the requested state.
    pub fn hold(&mut self, hold: bool) -> bool {
        if self.on_hold == hold {
            return false;
        }
        self.on_hold = hold;
        for stream in &mut self.streams {
            stream.hold(hold);
        }
        info!(call_id = %self.id, hold, "call hold changed");
        true
    }

    /// Arm the timer that expires an unanswered call
    pub fn arm_local_timeout(&mut self, timeout: Duration, tx: &mpsc::UnboundedSender<LoopEvent>) {
        let call = self.id.clone();
        self.local_timer
            .start(timeout, tx, move |generation| LoopEvent::LocalTimeout { call, generation });
    }

    /// Accept a local-timeout event; `true` if the call should be expired
    pub fn on_local_timeout(&mut self, generation: u64) -> bool {
        self.local_timer.expire(generation) && !self.state.is_established() && !self.state.is_terminal()
    }

    /// Release streams and strategy sessions. Runs once; later calls return
    /// `false`.
    pub fn release_media(&mut self) -> bool {
        if self.media_released {
            return false;
        }
        self.media_released = true;
        self.local_timer.cancel();
        for device in &mut self.devices {
            device.stop();
        }
        self.devices.clear();
        for stream in &mut self.streams {
            stream.terminate();
        }
        self.streams.clear();
        self.mnat = None;
        self.menc = None;
        true
    }

    /// Enter TERMINATED and release everything the call owns
    pub fn terminate(&mut self) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        if let Err(e) = self.set_state(CallState::Terminated) {
            warn!(call_id = %self.id, "terminate: {}", e);
            self.state = CallState::Terminated;
        }
        self.release_media();
        true
    }

    pub fn sample_metrics(&mut self, now: Instant) {
        for stream in &mut self.streams {
            stream.sample_metrics(now);
        }
    }

    pub fn duration(&self) -> Duration {
        self.established.map(|t| t.elapsed()).unwrap_or_default()
    }

    pub fn info(&self) -> CallInfo {
        CallInfo {
            id: self.id.clone(),
            aor: self.aor.clone(),
            peer: self.peer.clone(),
            state: self.state,
            direction: self.direction,
            linenum: self.linenum,
            started_at: self.started_at,
            established_at: self.established_at,
            duration: self.duration(),
            on_hold: self.on_hold,
            transferred_from: self.transferor.clone(),
        }
    }
}

impl Drop for Call {
    fn drop(&mut self) {
        self.release_media();
    }
}

fn transition_name(next: CallState) -> &'static str {
    match next {
        CallState::Incoming => "receive",
        CallState::Outgoing => "connect",
        CallState::Ringing => "ring",
        CallState::Early => "progress",
        CallState::Established => "establish",
        CallState::Terminated => "terminate",
        CallState::Idle | CallState::Unknown => "reset",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsua_infra_common::Range;
    use std::net::Ipv4Addr;

    fn any_port() -> StreamConfig {
        StreamConfig {
            rtp_ports: Range::new(0, 0),
            ..Default::default()
        }
    }

    fn localhost() -> IpAddr {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    }

    #[test]
    fn test_state_machine_rejects_backward_moves() {
        let mut call = Call::new(CallId::from("c1"), "sip:a@x", "sip:b@x", CallDirection::Outgoing, 1);
        assert!(call.set_state(CallState::Outgoing).unwrap());
        assert!(call.set_state(CallState::Ringing).unwrap());
        assert!(call.set_state(CallState::Early).unwrap());
        assert!(call.set_state(CallState::Ringing).unwrap());
        assert!(!call.set_state(CallState::Ringing).unwrap());
        assert!(call.set_state(CallState::Established).unwrap());

        let err = call.set_state(CallState::Ringing).unwrap_err();
        assert!(matches!(err, CallError::InvalidState { state: CallState::Established, .. }));
        assert_eq!(call.state(), CallState::Established);
        assert!(call.info().established_at.is_some());
    }

    #[tokio::test]
    async fn test_media_released_once() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut call = Call::new(CallId::from("c2"), "sip:a@x", "sip:b@x", CallDirection::Outgoing, 1);
        call.alloc_media(&any_port(), localhost(), VideoMode::On, None, None, &tx).unwrap();
        assert_eq!(call.streams().len(), 2);
        assert!(call.has_video());
        assert_eq!(call.streams()[1].tag(), &StreamTag::new("c2", 1));

        assert!(call.terminate());
        assert_eq!(call.state(), CallState::Terminated);
        assert!(call.streams().is_empty());
        assert!(!call.terminate());
        assert!(!call.release_media());
    }

    #[tokio::test]
    async fn test_hold_toggles_all_streams() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut call = Call::new(CallId::from("c3"), "sip:a@x", "sip:b@x", CallDirection::Incoming, 1);
        call.alloc_media(&any_port(), localhost(), VideoMode::On, None, None, &tx).unwrap();

        assert!(call.hold(true));
        assert!(!call.hold(true));
        let media = call.local_media().unwrap();
        assert!(media.iter().all(|m| m.direction == MediaDirection::SendOnly));

        assert!(call.hold(false));
        let media = call.local_media().unwrap();
        assert!(media.iter().all(|m| m.direction == MediaDirection::SendRecv));
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_timeout_ignored_once_established() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut call = Call::new(CallId::from("c4"), "sip:a@x", "sip:b@x", CallDirection::Outgoing, 1);
        call.set_state(CallState::Outgoing).unwrap();
        call.arm_local_timeout(Duration::from_secs(10), &tx);

        let LoopEvent::LocalTimeout { generation, .. } = rx.recv().await.unwrap() else {
            panic!("expected local timeout");
        };
        assert!(call.on_local_timeout(generation));

        let mut answered = Call::new(CallId::from("c5"), "sip:a@x", "sip:b@x", CallDirection::Outgoing, 2);
        answered.set_state(CallState::Outgoing).unwrap();
        answered.arm_local_timeout(Duration::from_secs(10), &tx);
        answered.set_state(CallState::Established).unwrap();
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(rx.try_recv().is_err());
    }
}
