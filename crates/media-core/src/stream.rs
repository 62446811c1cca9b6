//! One media line of a call.
//!
//! A [`Stream`] is created by its call once negotiation starts. Bring-up
//! binds the transport, then attaches the per-media state of the call's NAT
//! and encryption sessions. Outbound media stays suppressed until every
//! configured gate is open:
//!
//! - the stream was started by its call;
//! - a remote RTP address is known;
//! - the NAT strategy reported connectivity, if it asked to be waited for;
//! - the encryption strategy reported `Secure`, if it asked to be waited for;
//! - the negotiated direction allows sending.
//!
//! The RTP timeout does not wait for those gates. It is armed as soon as the
//! stream is started and its local direction can receive, so receive-only
//! streams are watched too.
//!
//! The stream never talks to its call directly. Received datagrams, timer
//! expiry and strategy callbacks arrive as [`MediaEvent`]s on the loop, which
//! routes them back here through the stream's [`StreamTag`]. Frames released
//! by the jitter buffer go to an optional playout sink.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use rsua_infra_common::{Range, Timer};
use rsua_rtp_core::payload::H264Packetizer;
use rsua_rtp_core::{Metric, PacketChannel, RtpHeader, RtpPacket, RtpSocket, SeqResult, SequenceTracker};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::error::{MediaError, Result};
use crate::events::{MediaEvent, MediaEventSender};
use crate::jitter::{JitterBuffer, JitterBufferConfig, JitterBufferStats, JitterBufferType};
use crate::menc::{MediaEncryption, MencEvent, MencMedia, MencNotifier, MencSession};
use crate::mnat::{MediaNat, MnatMedia, MnatNotifier, MnatSession};
use crate::registry::Named;
use crate::types::{LocalMedia, MediaDirection, MediaFrame, MediaKind, RemoteMedia, StreamTag};

/// Transport protocol advertised when no encryption is in use
pub const DEFAULT_PROTO: &str = "RTP/AVP";

/// RTP payload budget when packetizing video frames
pub const VIDEO_MAX_PAYLOAD: usize = 1200;

/// Process-wide stream settings, taken from configuration
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub rtp_ports: Range,
    pub rtcp_mux: bool,
    pub jbuf: JitterBufferConfig,
    /// `None` disables RTP timeout detection
    pub rtp_timeout: Option<Duration>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            rtp_ports: Range::new(1024, 49152),
            rtcp_mux: false,
            jbuf: JitterBufferConfig::default(),
            rtp_timeout: None,
        }
    }
}

/// Per-stream parameters chosen by the owning call
#[derive(Debug, Clone)]
pub struct StreamParams {
    pub kind: MediaKind,
    pub tag: StreamTag,
    pub laddr: IpAddr,
    pub payload_type: u8,
    pub clock_rate: u32,
    pub direction: MediaDirection,
}

impl StreamParams {
    pub fn new(kind: MediaKind, tag: StreamTag, laddr: IpAddr) -> Self {
        let payload_type = match kind {
            MediaKind::Audio => 0,
            MediaKind::Video => 96,
        };
        Self {
            kind,
            tag,
            laddr,
            payload_type,
            clock_rate: kind.default_clock_rate(),
            direction: MediaDirection::SendRecv,
        }
    }

    pub fn with_payload_type(mut self, payload_type: u8) -> Self {
        self.payload_type = payload_type;
        self
    }

    pub fn with_direction(mut self, direction: MediaDirection) -> Self {
        self.direction = direction;
        self
    }
}

/// Result of feeding one received datagram to [`Stream::receive_rtp`]
#[derive(Debug, Default)]
pub struct ReceiveOutcome {
    /// Packets released by the jitter buffer, in playout order
    pub delivered: Vec<RtpPacket>,
    /// This was the first RTP packet ever received on the stream
    pub established: bool,
}

pub struct Stream {
    kind: MediaKind,
    tag: StreamTag,
    sock: RtpSocket,
    events: MediaEventSender,

    jbuf: JitterBuffer,
    seq_rx: SequenceTracker,
    ssrc_rx: Option<u32>,
    metric_tx: Metric,
    metric_rx: Metric,
    rtcp_rx: u64,
    sink: Option<mpsc::Sender<MediaFrame>>,
    playout_overruns: u64,

    mnat_media: Option<Box<dyn MnatMedia>>,
    wait_mnat: bool,
    menc_media: Option<Box<dyn MencMedia>>,
    wait_menc: bool,
    proto: String,

    raddr_rtp: Option<SocketAddr>,
    raddr_rtcp: Option<SocketAddr>,
    pt_enc: u8,
    pt_dec: u8,
    ldir: MediaDirection,
    rdir: MediaDirection,
    ssrc_tx: u32,
    seq_tx: u16,

    rtcp_mux: bool,
    hold: bool,
    mnat_connected: bool,
    menc_secure: bool,
    terminated: bool,
    rtp_estab: bool,
    started: bool,
    active: bool,

    rtp_timer: Timer,
    rtp_timeout: Option<Duration>,
    ts_last: Option<Instant>,
}

impl Stream {
    /// Bind the transport and attach NAT and encryption media.
    ///
    /// A transport that cannot be bound is reported as
    /// [`MediaError::ResourceExhaustion`] and leaves nothing behind.
    pub fn alloc(
        params: StreamParams,
        cfg: &StreamConfig,
        mnat: Option<(&dyn MediaNat, &mut dyn MnatSession)>,
        menc: Option<(&dyn MediaEncryption, &mut dyn MencSession)>,
        events: MediaEventSender,
    ) -> Result<Self> {
        let StreamParams {
            kind,
            tag,
            laddr,
            payload_type,
            clock_rate,
            direction,
        } = params;

        let (min, max) = port_bounds(cfg.rtp_ports)?;
        let mut sock = RtpSocket::bind_in_range(laddr, min, max, cfg.rtcp_mux)
            .map_err(|e| MediaError::ResourceExhaustion(format!("{} transport for {}: {}", kind, tag, e)))?;

        let local_rtp = sock.local_rtp_addr()?;
        let local_rtcp = sock.local_rtcp_addr()?;

        let (mnat_media, wait_mnat) = match mnat {
            Some((nat, session)) => {
                let media = session.new_media(kind, local_rtp, local_rtcp, MnatNotifier::new(tag.clone(), events.clone()))?;
                debug!(stream = %tag, mnat = nat.id(), "mnat media created");
                (Some(media), nat.wait_connected())
            }
            None => (None, false),
        };

        let (menc_media, wait_menc, proto) = match menc {
            Some((enc, session)) => {
                let media = session.new_media(kind, local_rtp, MencNotifier::new(tag.clone(), events.clone()))?;
                debug!(stream = %tag, menc = enc.id(), "menc media created");
                (Some(media), enc.wait_secure(), enc.sdp_proto().to_string())
            }
            None => (None, false, DEFAULT_PROTO.to_string()),
        };

        let rx_tag = tag.clone();
        let rx_events = events.clone();
        sock.start_receivers(move |channel, data, src| {
            let event = match channel {
                PacketChannel::Rtp => MediaEvent::Rtp { tag: rx_tag.clone(), data, src },
                PacketChannel::Rtcp => MediaEvent::Rtcp { tag: rx_tag.clone(), data, src },
            };
            let _ = rx_events.send(event);
        });

        let mut jbuf_cfg = cfg.jbuf.clone();
        jbuf_cfg.clock_rate = clock_rate;

        info!(stream = %tag, kind = %kind, local = %local_rtp, rtcp_mux = cfg.rtcp_mux, "stream allocated");

        Ok(Self {
            kind,
            tag,
            sock,
            events,
            jbuf: JitterBuffer::new(jbuf_cfg),
            seq_rx: SequenceTracker::new(),
            ssrc_rx: None,
            metric_tx: Metric::new(),
            metric_rx: Metric::new(),
            rtcp_rx: 0,
            sink: None,
            playout_overruns: 0,
            mnat_media,
            wait_mnat,
            menc_media,
            wait_menc,
            proto,
            raddr_rtp: None,
            raddr_rtcp: None,
            pt_enc: payload_type,
            pt_dec: payload_type,
            ldir: direction,
            rdir: MediaDirection::SendRecv,
            ssrc_tx: rand::random(),
            seq_tx: rand::random::<u16>() & 0x7fff,
            rtcp_mux: cfg.rtcp_mux,
            hold: false,
            mnat_connected: false,
            menc_secure: false,
            terminated: false,
            rtp_estab: false,
            started: false,
            active: false,
            rtp_timer: Timer::new(),
            rtp_timeout: cfg.rtp_timeout,
            ts_last: None,
        })
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn tag(&self) -> &StreamTag {
        &self.tag
    }

    /// Local direction currently in effect, hold included
    pub fn local_direction(&self) -> MediaDirection {
        if self.hold { self.ldir.on_hold() } else { self.ldir }
    }

    /// Direction agreed with the peer
    pub fn direction(&self) -> MediaDirection {
        self.local_direction().negotiate(self.rdir)
    }

    /// Every gate is open: media may be transmitted
    pub fn is_ready(&self) -> bool {
        !self.terminated
            && self.started
            && self.raddr_rtp.is_some()
            && (!self.wait_mnat || self.mnat_connected)
            && (!self.wait_menc || self.menc_secure)
            && self.direction().can_send()
    }

    /// Mark the stream as started by its call and open it if the gates allow.
    /// The RTP timeout is armed either way.
    pub fn start(&mut self) -> bool {
        if self.terminated {
            return false;
        }
        self.started = true;
        if self.try_activate() {
            return true;
        }
        if !self.rtp_timer.is_running() {
            self.arm_rtp_timer();
        }
        false
    }

    /// Returns `true` when this call opened the stream for the first time
    fn try_activate(&mut self) -> bool {
        if self.active || !self.is_ready() {
            return false;
        }
        self.active = true;
        info!(stream = %self.tag, remote = ?self.raddr_rtp, "stream active");
        self.arm_rtp_timer();
        true
    }

    fn arm_rtp_timer(&mut self) {
        let Some(timeout) = self.rtp_timeout else {
            return;
        };
        if self.terminated || !self.local_direction().can_recv() {
            return;
        }
        let tag = self.tag.clone();
        self.rtp_timer
            .start(timeout, &self.events, move |generation| MediaEvent::RtpTimeout { tag, generation });
    }

    /// Change the RTP timeout; takes effect on the next arming
    pub fn enable_rtp_timeout(&mut self, timeout: Option<Duration>) {
        self.rtp_timeout = timeout;
        match timeout {
            Some(_) if self.started => self.arm_rtp_timer(),
            Some(_) => {}
            None => self.rtp_timer.cancel(),
        }
    }

    /// Send one RTP packet. `Ok(false)` means a gate is still closed and
    /// nothing was sent.
    pub async fn send(&mut self, marker: bool, timestamp: u32, payload: &[u8]) -> Result<bool> {
        if !self.is_ready() {
            trace!(stream = %self.tag, "send suppressed");
            return Ok(false);
        }
        let Some(dest) = self.raddr_rtp else {
            return Ok(false);
        };
        self.try_activate();

        let header = RtpHeader::new(self.pt_enc, self.seq_tx, timestamp, self.ssrc_tx).with_marker(marker);
        let packet = RtpPacket::new(header, Bytes::copy_from_slice(payload));
        let mut wire = BytesMut::from(&packet.serialize()?[..]);

        if let Some(menc) = self.menc_media.as_mut() {
            if let Err(e) = menc.protect_rtp(&mut wire) {
                self.metric_tx.add_errors(1);
                return Err(e);
            }
        }

        if let Err(e) = self.sock.send_rtp(&wire, dest).await {
            self.metric_tx.add_errors(1);
            return Err(e.into());
        }
        self.seq_tx = self.seq_tx.wrapping_add(1);
        self.metric_tx.add_packet(wire.len());
        Ok(true)
    }

    /// Packetize an H.264 access unit and send it. Returns the number of
    /// packets sent; 0 while a gate is closed.
    pub async fn send_h264(&mut self, timestamp: u32, access_unit: &[u8], maxsz: usize) -> Result<usize> {
        if self.kind != MediaKind::Video {
            return Err(MediaError::Unsupported(format!("H.264 on {} stream {}", self.kind, self.tag)));
        }
        if !self.is_ready() {
            return Ok(0);
        }
        let payloads = H264Packetizer::new(maxsz).packetize(timestamp, access_unit)?;
        let mut sent = 0;
        for payload in payloads {
            if self.send(payload.marker, timestamp, &payload.bytes).await? {
                sent += 1;
            }
        }
        Ok(sent)
    }

    /// Send one captured frame: a single packet for audio, a packetized
    /// access unit for video. Returns the number of packets sent.
    pub async fn send_frame(&mut self, frame: &MediaFrame) -> Result<usize> {
        match self.kind {
            MediaKind::Audio => Ok(self.send(frame.marker, frame.timestamp, &frame.data).await? as usize),
            MediaKind::Video => self.send_h264(frame.timestamp, &frame.data, VIDEO_MAX_PAYLOAD).await,
        }
    }

    /// Send an already encoded RTCP packet to the peer
    pub async fn send_rtcp(&mut self, data: &[u8]) -> Result<bool> {
        let Some(dest) = self.raddr_rtcp.or(self.raddr_rtp) else {
            return Ok(false);
        };
        if self.terminated {
            return Ok(false);
        }
        self.sock.send_rtcp(data, dest).await?;
        Ok(true)
    }

    /// Hand frames released by the jitter buffer to a playback consumer.
    /// Frames it has no room for are dropped and counted.
    pub fn set_sink(&mut self, sink: mpsc::Sender<MediaFrame>) {
        self.sink = Some(sink);
    }

    /// Frames dropped because the playout sink was full
    pub fn playout_overruns(&self) -> u64 {
        self.playout_overruns
    }

    /// Handle one received RTP datagram.
    ///
    /// The packet re-arms the RTP timeout, goes through the jitter buffer, and
    /// whatever the buffer releases is checked against the sequence tracker.
    /// Loss is counted once, as the sequence gap seen when the packet after
    /// the hole is released. Duplicates are discarded. Packets behind the
    /// playout point are discarded when reordering, and delivered as they
    /// come when the jitter buffer is off.
    pub fn receive_rtp(&mut self, data: Bytes, src: SocketAddr, now: Instant) -> Result<ReceiveOutcome> {
        let mut outcome = ReceiveOutcome::default();
        if self.terminated {
            return Ok(outcome);
        }

        let data = match self.menc_media.as_mut() {
            Some(menc) => {
                let mut buf = BytesMut::from(&data[..]);
                if let Err(e) = menc.unprotect_rtp(&mut buf) {
                    self.metric_rx.add_errors(1);
                    return Err(e);
                }
                buf.freeze()
            }
            None => data,
        };

        let size = data.len();
        let packet = match RtpPacket::parse_bytes(data) {
            Ok(packet) => packet,
            Err(e) => {
                self.metric_rx.add_errors(1);
                return Err(e.into());
            }
        };

        self.metric_rx.add_packet_at(size, now);
        self.ts_last = Some(now);
        if self.started {
            self.arm_rtp_timer();
        }

        if !self.rtp_estab {
            self.rtp_estab = true;
            outcome.established = true;
            info!(stream = %self.tag, src = %src, pt = packet.header.payload_type, "RTP established");
        }

        if packet.header.payload_type != self.pt_dec {
            trace!(stream = %self.tag, pt = packet.header.payload_type, "unexpected payload type");
        }

        let ssrc = packet.header.ssrc;
        match self.ssrc_rx {
            Some(prev) if prev != ssrc => {
                debug!(stream = %self.tag, "SSRC changed {:08x} -> {:08x}, flushing jitter buffer", prev, ssrc);
                self.jbuf.flush();
                self.ssrc_rx = Some(ssrc);
            }
            None => self.ssrc_rx = Some(ssrc),
            _ => {}
        }

        let reordering = self.jbuf.jb_type() != JitterBufferType::Off;
        if let Err(e) = self.jbuf.put(packet, now) {
            trace!(stream = %self.tag, ?e, "jitter buffer refused packet");
        }

        while let Some(packet) = self.jbuf.get() {
            let result = self.seq_rx.update(packet.header.ssrc, packet.header.sequence_number);
            let keep = result.is_accepted() || (!reordering && result == SeqResult::Late);
            if !keep {
                trace!(stream = %self.tag, seq = packet.header.sequence_number, ?result, "packet discarded");
                continue;
            }
            if let SeqResult::Gap { lost } = result {
                debug!(stream = %self.tag, lost, "sequence gap");
                self.metric_rx.add_errors(lost as u64);
            }
            if self.local_direction().can_recv() {
                self.play(&packet);
                outcome.delivered.push(packet);
            }
        }

        Ok(outcome)
    }

    fn play(&mut self, packet: &RtpPacket) {
        let Some(sink) = &self.sink else {
            return;
        };
        let frame = MediaFrame {
            timestamp: packet.header.timestamp,
            marker: packet.header.marker,
            data: packet.payload.clone(),
        };
        match sink.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => self.playout_overruns += 1,
            Err(TrySendError::Closed(_)) => {
                debug!(stream = %self.tag, "playout sink closed");
                self.sink = None;
            }
        }
    }

    pub fn receive_rtcp(&mut self, data: &Bytes, src: SocketAddr) {
        if self.terminated {
            return;
        }
        self.rtcp_rx += 1;
        trace!(stream = %self.tag, src = %src, len = data.len(), "RTCP received");
    }

    /// Accept an RTP-timeout event. Yields the error to raise on the call, at
    /// most once per arming; the timer stays idle until the next packet.
    pub fn on_rtp_timeout(&mut self, generation: u64) -> Option<MediaError> {
        if !self.rtp_timer.expire(generation) || self.terminated {
            return None;
        }
        if !self.local_direction().can_recv() {
            return None;
        }
        let timeout = self.rtp_timeout?;
        warn!(stream = %self.tag, "no RTP packets received for {:?}", timeout);
        Some(MediaError::Timeout(format!(
            "no {} RTP packets received for {} ms",
            self.kind,
            timeout.as_millis()
        )))
    }

    /// NAT connectivity reached. Returns `true` if the stream just opened.
    pub fn on_mnat_connected(&mut self, rtp_addr: Option<SocketAddr>, rtcp_addr: Option<SocketAddr>) -> bool {
        if self.terminated {
            return false;
        }
        self.mnat_connected = true;
        if rtp_addr.is_some() {
            self.raddr_rtp = rtp_addr;
        }
        if rtcp_addr.is_some() {
            self.raddr_rtcp = rtcp_addr;
        }
        info!(stream = %self.tag, remote = ?self.raddr_rtp, "mnat connected");
        self.try_activate()
    }

    /// Encryption event. Returns `true` if the stream just opened.
    pub fn on_menc_event(&mut self, event: MencEvent, param: &str) -> bool {
        if self.terminated {
            return false;
        }
        match event {
            MencEvent::Secure => {
                self.menc_secure = true;
                info!(stream = %self.tag, param, "media secure");
                self.try_activate()
            }
            other => {
                debug!(stream = %self.tag, event = %other, param, "menc event");
                false
            }
        }
    }

    /// Put the stream on hold or take it off. Returns `false` if nothing
    /// changed.
    pub fn hold(&mut self, hold: bool) -> bool {
        if self.hold == hold || self.terminated {
            return false;
        }
        self.hold = hold;
        debug!(stream = %self.tag, hold, dir = %self.local_direction(), "hold changed");
        if hold {
            self.rtp_timer.cancel();
        } else if self.started {
            self.arm_rtp_timer();
        }
        self.try_activate();
        true
    }

    pub fn is_held(&self) -> bool {
        self.hold
    }

    pub fn set_ldir(&mut self, dir: MediaDirection) {
        self.ldir = dir;
        self.try_activate();
    }

    /// Our description of this media line, for an offer or answer
    pub fn local_media(&self) -> Result<LocalMedia> {
        Ok(LocalMedia {
            kind: self.kind,
            rtp_addr: self.sock.local_rtp_addr()?,
            rtcp_addr: self.sock.local_rtcp_addr()?,
            payload_type: self.pt_dec,
            rtcp_mux: self.rtcp_mux,
            direction: self.local_direction(),
            proto: self.proto.clone(),
        })
    }

    /// Apply the peer's description of this media line
    pub fn update_remote(&mut self, remote: &RemoteMedia) -> Result<()> {
        if remote.kind != self.kind {
            return Err(MediaError::InvalidInput(format!(
                "{} description for {} stream {}",
                remote.kind, self.kind, self.tag
            )));
        }
        self.raddr_rtp = remote.rtp_addr;
        self.raddr_rtcp = match (remote.rtcp_addr, remote.rtp_addr) {
            (Some(addr), _) => Some(addr),
            (None, Some(rtp)) if remote.rtcp_mux || self.rtcp_mux => Some(rtp),
            (None, Some(rtp)) => Some(SocketAddr::new(rtp.ip(), rtp.port().wrapping_add(1))),
            (None, None) => None,
        };
        self.pt_enc = remote.payload_type;
        self.rdir = remote.direction;
        self.rtcp_mux = self.rtcp_mux && remote.rtcp_mux;

        if let Some(mnat) = self.mnat_media.as_mut() {
            mnat.remote_update(remote);
        }
        debug!(stream = %self.tag, remote = ?self.raddr_rtp, dir = %self.rdir, "remote media updated");
        self.try_activate();
        Ok(())
    }

    /// Refresh both bitrate estimates
    pub fn sample_metrics(&mut self, now: Instant) {
        self.metric_tx.sample(now);
        self.metric_rx.sample(now);
    }

    /// Stop timers, close the transport and drop strategy state. Only the
    /// first call does anything.
    pub fn terminate(&mut self) -> bool {
        if self.terminated {
            return false;
        }
        self.terminated = true;
        self.active = false;
        self.rtp_timer.cancel();
        self.sock.close();
        self.mnat_media = None;
        self.menc_media = None;
        self.jbuf.flush();
        self.sink = None;
        debug!(
            stream = %self.tag,
            tx_packets = self.metric_tx.n_packets(),
            rx_packets = self.metric_rx.n_packets(),
            rx_errors = self.metric_rx.n_err(),
            "stream terminated"
        );
        true
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    pub fn rtp_established(&self) -> bool {
        self.rtp_estab
    }

    pub fn mnat_connected(&self) -> bool {
        self.mnat_connected
    }

    pub fn menc_secure(&self) -> bool {
        self.menc_secure
    }

    pub fn rtcp_mux(&self) -> bool {
        self.rtcp_mux
    }

    pub fn local_rtp_addr(&self) -> Result<SocketAddr> {
        Ok(self.sock.local_rtp_addr()?)
    }

    pub fn remote_rtp_addr(&self) -> Option<SocketAddr> {
        self.raddr_rtp
    }

    pub fn remote_rtcp_addr(&self) -> Option<SocketAddr> {
        self.raddr_rtcp
    }

    pub fn ssrc_tx(&self) -> u32 {
        self.ssrc_tx
    }

    pub fn ssrc_rx(&self) -> Option<u32> {
        self.ssrc_rx
    }

    pub fn metric_tx(&self) -> &Metric {
        &self.metric_tx
    }

    pub fn metric_rx(&self) -> &Metric {
        &self.metric_rx
    }

    pub fn rtcp_packets(&self) -> u64 {
        self.rtcp_rx
    }

    pub fn jitter_stats(&self) -> JitterBufferStats {
        self.jbuf.stats()
    }

    /// Time since the last RTP packet, if any arrived
    pub fn idle_for(&self, now: Instant) -> Option<Duration> {
        self.ts_last.map(|ts| now.saturating_duration_since(ts))
    }
}

fn port_bounds(range: Range) -> Result<(u16, u16)> {
    let min = u16::try_from(range.min);
    let max = u16::try_from(range.max);
    match (min, max) {
        (Ok(min), Ok(max)) if min <= max => Ok((min, max)),
        _ => Err(MediaError::InvalidInput(format!("invalid RTP port range {}", range))),
    }
}
