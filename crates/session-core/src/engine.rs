//! The event loop.
//!
//! [`Engine`] owns the [`UaContext`] and is the only place calls and streams
//! are mutated. Three kinds of input reach it through channels:
//!
//! - commands from [`EngineHandle`]s on other tasks;
//! - [`SignalingEvent`]s posted by the user agents' signaling layers;
//! - [`MediaEvent`]s from socket receive tasks, strategy notifiers and timers;
//! - outbound media frames from capture devices and handles.
//!
//! Handlers never block. Their errors are logged and never leave the loop.
//! The synchronous operations (`connect`, `answer`, ...) are also public so
//! the loop can be driven directly from a single task. Outbound frames are
//! only drained by [`Engine::step`], since sending awaits the socket.

use std::sync::Arc;
use std::time::Duration;

use rsua_infra_common::{Conf, Timer};
use rsua_media_core::{
    DeviceThread, FrameSource, MediaEncryption, MediaEvent, MediaEventSender, MediaFrame, MediaKind, MediaNat,
    RemoteMedia, StreamConfig,
};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::call::Call;
use crate::config::CoreConfig;
use crate::errors::{CallError, ErrorKind, Result, media_kind};
use crate::events::{EVENT_CHANNEL_CAPACITY, UaEvent, UaEventReceiver};
use crate::redial::{RedialDecision, RedialPolicy};
use crate::signaling::{Signaling, SignalingEvent, SignalingEventSender};
use crate::types::{CALL_CODE_LOCAL_TIMEOUT, CallDirection, CallId, CallInfo, CallState, CustomHeader, VideoMode};
use crate::ua::{UaConfig, UaContext, UserAgent};

/// Period of metrics sampling
pub const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(1);

/// SIP response used when the call limit is reached
const CODE_BUSY: u16 = 486;

const CODE_SERVER_ERROR: u16 = 500;

/// Outbound frames queued between devices or handles and the loop
pub const FRAME_QUEUE_CAPACITY: usize = 64;

type Reply<T> = oneshot::Sender<Result<T>>;

/// Messages on the loop's own channel
pub enum LoopEvent {
    Command(Command),
    Signaling { aor: String, event: SignalingEvent },
    LocalTimeout { call: CallId, generation: u64 },
    Redial { generation: u64 },
}

/// A frame waiting to go out on one stream of a call
struct OutboundFrame {
    call: CallId,
    index: usize,
    frame: MediaFrame,
}

/// Requests sent by an [`EngineHandle`]
pub enum Command {
    AddUserAgent {
        config: UaConfig,
        signaling: Box<dyn Signaling>,
        reply: Reply<()>,
    },
    Connect {
        aor: Option<String>,
        target: String,
        video: VideoMode,
        headers: Vec<CustomHeader>,
        reply: Reply<CallId>,
    },
    Answer {
        call: CallId,
        code: u16,
        video: VideoMode,
        reply: Reply<()>,
    },
    Progress {
        call: CallId,
        reply: Reply<()>,
    },
    Hangup {
        call: CallId,
        code: u16,
        reason: String,
        reply: Reply<()>,
    },
    HangupAll {
        reply: oneshot::Sender<usize>,
    },
    Hold {
        call: CallId,
        hold: bool,
        reply: Reply<bool>,
    },
    Modify {
        call: CallId,
        reply: Reply<()>,
    },
    Transfer {
        call: CallId,
        uri: String,
        reply: Reply<CallId>,
    },
    Refer {
        call: CallId,
        uri: String,
        reply: Reply<()>,
    },
    SendDigit {
        call: CallId,
        key: char,
        reply: Reply<()>,
    },
    ListCalls {
        reply: oneshot::Sender<Vec<CallInfo>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable handle for talking to a running [`Engine`] from other tasks
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::UnboundedSender<LoopEvent>,
    frames: mpsc::Sender<OutboundFrame>,
    events: broadcast::Sender<UaEvent>,
}

impl EngineHandle {
    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(LoopEvent::Command(build(reply)))
            .map_err(|_| CallError::EngineStopped)?;
        rx.await.map_err(|_| CallError::EngineStopped)
    }

    pub async fn add_user_agent(&self, config: UaConfig, signaling: Box<dyn Signaling>) -> Result<()> {
        self.request(|reply| Command::AddUserAgent {
            config,
            signaling,
            reply,
        })
        .await?
    }

    /// Dial `target` from the current user agent
    pub async fn connect(&self, target: impl Into<String>, video: VideoMode) -> Result<CallId> {
        self.connect_from(None, target, video, Vec::new()).await
    }

    pub async fn connect_from(
        &self,
        aor: Option<String>,
        target: impl Into<String>,
        video: VideoMode,
        headers: Vec<CustomHeader>,
    ) -> Result<CallId> {
        let target = target.into();
        self.request(|reply| Command::Connect {
            aor,
            target,
            video,
            headers,
            reply,
        })
        .await?
    }

    pub async fn answer(&self, call: &CallId, code: u16, video: VideoMode) -> Result<()> {
        let call = call.clone();
        self.request(|reply| Command::Answer { call, code, video, reply }).await?
    }

    pub async fn progress(&self, call: &CallId) -> Result<()> {
        let call = call.clone();
        self.request(|reply| Command::Progress { call, reply }).await?
    }

    pub async fn hangup(&self, call: &CallId, code: u16, reason: impl Into<String>) -> Result<()> {
        let call = call.clone();
        let reason = reason.into();
        self.request(|reply| Command::Hangup {
            call,
            code,
            reason,
            reply,
        })
        .await?
    }

    /// Returns the number of calls that were hung up
    pub async fn hangup_all(&self) -> Result<usize> {
        self.request(|reply| Command::HangupAll { reply }).await
    }

    pub async fn hold(&self, call: &CallId, hold: bool) -> Result<bool> {
        let call = call.clone();
        self.request(|reply| Command::Hold { call, hold, reply }).await?
    }

    pub async fn modify(&self, call: &CallId) -> Result<()> {
        let call = call.clone();
        self.request(|reply| Command::Modify { call, reply }).await?
    }

    pub async fn transfer(&self, call: &CallId, uri: impl Into<String>) -> Result<CallId> {
        let call = call.clone();
        let uri = uri.into();
        self.request(|reply| Command::Transfer { call, uri, reply }).await?
    }

    pub async fn refer(&self, call: &CallId, uri: impl Into<String>) -> Result<()> {
        let call = call.clone();
        let uri = uri.into();
        self.request(|reply| Command::Refer { call, uri, reply }).await?
    }

    pub async fn send_digit(&self, call: &CallId, key: char) -> Result<()> {
        let call = call.clone();
        self.request(|reply| Command::SendDigit { call, key, reply }).await?
    }

    /// Queue one frame for stream `index` of `call`. Fails with
    /// [`CallError::ResourceExhaustion`] when the loop is behind; the frame
    /// is dropped.
    pub fn send_frame(&self, call: &CallId, index: usize, frame: MediaFrame) -> Result<()> {
        let out = OutboundFrame {
            call: call.clone(),
            index,
            frame,
        };
        match self.frames.try_send(out) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(CallError::ResourceExhaustion("outbound frame queue full".into())),
            Err(TrySendError::Closed(_)) => Err(CallError::EngineStopped),
        }
    }

    pub async fn calls(&self) -> Result<Vec<CallInfo>> {
        self.request(|reply| Command::ListCalls { reply }).await
    }

    /// Hang up every call and stop the loop
    pub async fn stop(&self) -> Result<()> {
        self.request(|reply| Command::Stop { reply }).await
    }

    pub fn subscribe(&self) -> UaEventReceiver {
        self.events.subscribe()
    }

    /// Sender a signaling layer uses to report events for user agent `aor`
    pub fn signaling_sender(&self, aor: impl Into<String>) -> SignalingEventSender {
        SignalingEventSender::new(aor, self.tx.clone())
    }

    pub fn is_running(&self) -> bool {
        !self.tx.is_closed()
    }
}

pub struct Engine {
    ctx: UaContext,
    config: CoreConfig,
    stream_cfg: StreamConfig,

    redial: RedialPolicy,
    redial_timer: Timer,
    /// User agent and target of the scheduled redial
    redial_pending: Option<(String, String)>,

    tx: mpsc::UnboundedSender<LoopEvent>,
    rx: mpsc::UnboundedReceiver<LoopEvent>,
    media_tx: MediaEventSender,
    media_rx: mpsc::UnboundedReceiver<MediaEvent>,
    frames_tx: mpsc::Sender<OutboundFrame>,
    frames_rx: mpsc::Receiver<OutboundFrame>,
    events: broadcast::Sender<UaEvent>,

    housekeeping: Option<Interval>,
    running: bool,
}

impl Engine {
    pub fn new(config: CoreConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (media_tx, media_rx) = mpsc::unbounded_channel();
        let (frames_tx, frames_rx) = mpsc::channel(FRAME_QUEUE_CAPACITY);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let redial = RedialPolicy::new(config.redial.attempts, config.redial.delay);
        let stream_cfg = config.avt.stream_config();

        info!(
            max_calls = config.call.max_calls,
            local_timeout = ?config.call.local_timeout,
            rtp_ports = %config.avt.rtp_ports,
            "engine created"
        );

        Self {
            ctx: UaContext::new(),
            config,
            stream_cfg,
            redial,
            redial_timer: Timer::new(),
            redial_pending: None,
            tx,
            rx,
            media_tx,
            media_rx,
            frames_tx,
            frames_rx,
            events,
            housekeeping: None,
            running: true,
        }
    }

    pub fn from_conf(conf: &dyn Conf) -> Self {
        Self::new(CoreConfig::from_conf(conf))
    }

    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            tx: self.tx.clone(),
            frames: self.frames_tx.clone(),
            events: self.events.clone(),
        }
    }

    pub fn subscribe(&self) -> UaEventReceiver {
        self.events.subscribe()
    }

    pub fn signaling_sender(&self, aor: impl Into<String>) -> SignalingEventSender {
        SignalingEventSender::new(aor, self.tx.clone())
    }

    pub fn context(&self) -> &UaContext {
        &self.ctx
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn redial_policy(&self) -> &RedialPolicy {
        &self.redial
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn register_mnat(&mut self, strategy: Arc<dyn MediaNat>) {
        self.ctx.register_mnat(strategy);
    }

    pub fn register_menc(&mut self, strategy: Arc<dyn MediaEncryption>) {
        self.ctx.register_menc(strategy);
    }

    pub fn add_user_agent(&mut self, config: UaConfig, signaling: Box<dyn Signaling>) -> Result<()> {
        self.ctx.add_user_agent(UserAgent::new(config, signaling))
    }

    // ---- loop ----

    /// Wait for one input and handle it. Returns `false` once stopped.
    pub async fn step(&mut self) -> bool {
        if !self.running {
            return false;
        }
        let tick = self.housekeeping.get_or_insert_with(|| {
            let mut interval = time::interval_at(Instant::now() + HOUSEKEEPING_INTERVAL, HOUSEKEEPING_INTERVAL);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        tokio::select! {
            biased;
            Some(event) = self.rx.recv() => self.handle_loop_event(event),
            Some(event) = self.media_rx.recv() => self.handle_media_event(event),
            Some(out) = self.frames_rx.recv() => self.on_outbound_frame(out).await,
            now = tick.tick() => self.housekeeping(now),
        }
        self.running
    }

    /// Run until stopped
    pub async fn run(&mut self) {
        info!("event loop started");
        while self.step().await {}
        info!("event loop stopped");
    }

    /// Run for at most `duration`, or until stopped
    pub async fn run_for(&mut self, duration: Duration) {
        let deadline = time::sleep(duration);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                running = self.step() => if !running { break },
            }
        }
    }

    /// Handle everything already queued without waiting. Returns the number
    /// of events handled.
    pub fn poll_pending(&mut self) -> usize {
        let mut handled = 0;
        while self.running {
            if let Ok(event) = self.rx.try_recv() {
                self.handle_loop_event(event);
            } else if let Ok(event) = self.media_rx.try_recv() {
                self.handle_media_event(event);
            } else {
                break;
            }
            handled += 1;
        }
        handled
    }

    /// Hang up all calls and stop the loop
    pub fn shutdown(&mut self) {
        if !self.running {
            return;
        }
        let closed = self.hangup_all();
        self.redial_timer.cancel();
        self.redial_pending = None;
        self.running = false;
        info!(closed, "engine shut down");
        self.emit(UaEvent::Shutdown);
    }

    fn emit(&self, event: UaEvent) {
        trace!(?event, "event");
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn handle_loop_event(&mut self, event: LoopEvent) {
        match event {
            LoopEvent::Command(cmd) => self.handle_command(cmd),
            LoopEvent::Signaling { aor, event } => {
                let call = event.call().clone();
                if let Err(e) = self.handle_signaling(&aor, event) {
                    warn!(call_id = %call, aor = %aor, "signaling event failed: {}", e);
                }
            }
            LoopEvent::LocalTimeout { call, generation } => self.on_local_timeout(&call, generation),
            LoopEvent::Redial { generation } => self.on_redial_timer(generation),
        }
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::AddUserAgent {
                config,
                signaling,
                reply,
            } => {
                let _ = reply.send(self.add_user_agent(config, signaling));
            }
            Command::Connect {
                aor,
                target,
                video,
                headers,
                reply,
            } => {
                let _ = reply.send(self.connect_with_headers(aor.as_deref(), &target, video, headers));
            }
            Command::Answer { call, code, video, reply } => {
                let _ = reply.send(self.answer(&call, code, video));
            }
            Command::Progress { call, reply } => {
                let _ = reply.send(self.progress(&call));
            }
            Command::Hangup {
                call,
                code,
                reason,
                reply,
            } => {
                let _ = reply.send(self.hangup(&call, code, &reason));
            }
            Command::HangupAll { reply } => {
                let _ = reply.send(self.hangup_all());
            }
            Command::Hold { call, hold, reply } => {
                let _ = reply.send(self.hold(&call, hold));
            }
            Command::Modify { call, reply } => {
                let _ = reply.send(self.modify(&call));
            }
            Command::Transfer { call, uri, reply } => {
                let _ = reply.send(self.transfer(&call, &uri));
            }
            Command::Refer { call, uri, reply } => {
                let _ = reply.send(self.refer(&call, &uri));
            }
            Command::SendDigit { call, key, reply } => {
                let _ = reply.send(self.send_digit(&call, key));
            }
            Command::ListCalls { reply } => {
                let _ = reply.send(self.calls());
            }
            Command::Stop { reply } => {
                self.shutdown();
                let _ = reply.send(());
            }
        }
    }

    // ---- call operations ----

    /// Dial `target` from user agent `aor`, or the current one
    pub fn connect(&mut self, aor: Option<&str>, target: &str, video: VideoMode) -> Result<CallId> {
        self.connect_with_headers(aor, target, video, Vec::new())
    }

    pub fn connect_with_headers(
        &mut self,
        aor: Option<&str>,
        target: &str,
        video: VideoMode,
        headers: Vec<CustomHeader>,
    ) -> Result<CallId> {
        let id = self.dial(aor, target, video, headers, None)?;
        if let Some(call) = self.ctx.call(&id) {
            self.redial.remember(call.peer());
        }
        Ok(id)
    }

    fn dial(
        &mut self,
        aor: Option<&str>,
        target: &str,
        video: VideoMode,
        headers: Vec<CustomHeader>,
        transferor: Option<CallId>,
    ) -> Result<CallId> {
        let target = target.trim();
        if target.is_empty() {
            return Err(CallError::invalid_input("empty dial target"));
        }
        let ua = self.ctx.select_ua(aor)?;
        let (mnat, menc) = self.ctx.strategies(ua)?;
        let linenum = self.ctx.alloc_linenum()?;
        let aor = self.ctx.uas[ua].aor().to_string();

        let id = CallId::new();
        let mut call = Call::new(id.clone(), aor.clone(), target, CallDirection::Outgoing, linenum);
        call.set_headers(headers);
        if let Some(transferor) = transferor {
            call.set_transferor(transferor);
        }
        call.alloc_media(&self.stream_cfg, self.config.media_laddr, video, mnat, menc, &self.media_tx)?;
        call.set_state(CallState::Outgoing)?;

        let offer = call.local_media()?;
        if let Err(e) = self.ctx.uas[ua].signaling().connect(&id, target, &offer, call.headers()) {
            warn!(call_id = %id, "connect to {} failed: {}", target, e);
            call.terminate();
            return Err(e);
        }
        call.mark_signaled();
        if let Some(timeout) = self.config.call.local_timeout {
            call.arm_local_timeout(timeout, &self.tx);
        }

        info!(call_id = %id, aor = %aor, linenum, "connecting to {}", target);
        self.ctx.insert_call(call);
        self.emit(UaEvent::CallOutgoing {
            call: id.clone(),
            aor,
            peer: target.to_string(),
        });
        Ok(id)
    }

    /// Accept an incoming call
    pub fn answer(&mut self, id: &CallId, code: u16, video: VideoMode) -> Result<()> {
        let (call, signaling) = self.ctx.call_and_signaling(id)?;
        if !matches!(call.state(), CallState::Incoming | CallState::Early) || call.direction() != CallDirection::Incoming {
            return Err(CallError::InvalidState {
                operation: "answer",
                state: call.state(),
            });
        }
        if video == VideoMode::Off {
            call.disable_video();
        }
        let answer = call.local_media()?;
        signaling.answer(id, code, &answer)?;
        call.set_state(CallState::Established)?;
        call.start_streams();
        info!(call_id = %id, code, "call answered");
        self.on_established(id);
        Ok(())
    }

    /// Send early media for an incoming call before answering it
    pub fn progress(&mut self, id: &CallId) -> Result<()> {
        let (call, signaling) = self.ctx.call_and_signaling(id)?;
        if call.state() != CallState::Incoming {
            return Err(CallError::InvalidState {
                operation: "progress",
                state: call.state(),
            });
        }
        let media = call.local_media()?;
        signaling.progress(id, &media)?;
        call.set_state(CallState::Early)?;
        call.start_streams();
        Ok(())
    }

    pub fn hangup(&mut self, id: &CallId, code: u16, reason: &str) -> Result<()> {
        if self.ctx.call(id).is_none() {
            return Err(CallError::CallNotFound(id.to_string()));
        }
        self.close_call(id, code, reason, true);
        Ok(())
    }

    /// Hang up every call. Returns how many were closed.
    pub fn hangup_all(&mut self) -> usize {
        let ids = self.ctx.call_ids();
        let count = ids.len();
        for id in ids {
            self.close_call(&id, 0, "Shutdown", true);
        }
        count
    }

    /// Put a call on hold or resume it. Returns `false` if it already was in
    /// the requested state.
    pub fn hold(&mut self, id: &CallId, hold: bool) -> Result<bool> {
        let (call, signaling) = self.ctx.call_and_signaling(id)?;
        if !call.state().is_established() {
            return Err(CallError::InvalidState {
                operation: if hold { "hold" } else { "resume" },
                state: call.state(),
            });
        }
        if !call.hold(hold) {
            return Ok(false);
        }
        let offer = call.local_media()?;
        if let Err(e) = signaling.modify(id, &offer) {
            call.hold(!hold);
            return Err(e);
        }
        Ok(true)
    }

    /// Re-offer the current media. A failure leaves the call as it was.
    pub fn modify(&mut self, id: &CallId) -> Result<()> {
        let (call, signaling) = self.ctx.call_and_signaling(id)?;
        if !call.state().is_established() {
            return Err(CallError::InvalidState {
                operation: "modify",
                state: call.state(),
            });
        }
        let offer = call.local_media()?;
        signaling.modify(id, &offer).inspect_err(|e| warn!(call_id = %id, "modify failed: {}", e))
    }

    /// Dial `uri` on behalf of call `id`. If that fails the peer of `id` is
    /// told so through sipfrag and nothing else changes.
    pub fn transfer(&mut self, id: &CallId, uri: &str) -> Result<CallId> {
        let call = self
            .ctx
            .call(id)
            .ok_or_else(|| CallError::CallNotFound(id.to_string()))?;
        let aor = call.aor().to_string();
        let video = if call.has_video() { VideoMode::On } else { VideoMode::Off };

        info!(call_id = %id, "transferring to {}", uri);
        match self.dial(Some(&aor), uri, video, Vec::new(), Some(id.clone())) {
            Ok(child) => Ok(child),
            Err(e) => {
                warn!(call_id = %id, "transfer to {} failed: {}", uri, e);
                self.notify_transferor(id, CODE_SERVER_ERROR, "Call Error");
                Err(e)
            }
        }
    }

    /// Ask the peer of `id` to call `uri`
    pub fn refer(&mut self, id: &CallId, uri: &str) -> Result<()> {
        let uri = uri.trim();
        if uri.is_empty() {
            return Err(CallError::invalid_input("empty refer target"));
        }
        let (_, signaling) = self.ctx.call_and_signaling(id)?;
        signaling.refer(id, uri)
    }

    pub fn send_digit(&mut self, id: &CallId, key: char) -> Result<()> {
        let key = key.to_ascii_uppercase();
        if !matches!(key, '0'..='9' | '*' | '#' | 'A'..='D') {
            return Err(CallError::invalid_input(format!("DTMF key '{}'", key)));
        }
        let (_, signaling) = self.ctx.call_and_signaling(id)?;
        signaling.send_dtmf(id, key)
    }

    /// Snapshot of all calls, by line number
    pub fn calls(&self) -> Vec<CallInfo> {
        let mut calls: Vec<CallInfo> = self.ctx.calls.values().map(Call::info).collect();
        calls.sort_by_key(|c| c.linenum);
        calls
    }

    pub fn call_info(&self, id: &CallId) -> Option<CallInfo> {
        self.ctx.call(id).map(Call::info)
    }

    // ---- media ----

    /// Send one frame on stream `index` of call `id` right away. Returns the
    /// number of RTP packets sent; 0 while the stream is not ready.
    pub async fn send_frame(&mut self, id: &CallId, index: usize, frame: &MediaFrame) -> Result<usize> {
        let stream = self
            .call_mut(id)?
            .stream_mut(index)
            .ok_or_else(|| CallError::invalid_input(format!("call {} has no stream {}", id, index)))?;
        Ok(stream.send_frame(frame).await?)
    }

    async fn on_outbound_frame(&mut self, out: OutboundFrame) {
        if let Err(e) = self.send_frame(&out.call, out.index, &out.frame).await {
            trace!(call_id = %out.call, index = out.index, "outbound frame dropped: {}", e);
        }
    }

    /// Capture from `source` into stream `index` of call `id`, one frame per
    /// `ptime`. The device runs until the call releases its media.
    pub fn attach_source<S>(&mut self, id: &CallId, index: usize, source: S, ptime: Duration) -> Result<()>
    where
        S: FrameSource<Frame = MediaFrame>,
    {
        let frames = self.frames_tx.clone();
        let call = self.call_mut(id)?;
        if call.stream_mut(index).is_none() {
            return Err(CallError::invalid_input(format!("call {} has no stream {}", id, index)));
        }
        let call_id = id.clone();
        let device = DeviceThread::spawn_with(format!("src-{}-{}", id, index), source, ptime, frames, move |frame| {
            OutboundFrame {
                call: call_id.clone(),
                index,
                frame,
            }
        })?;
        call.add_device(device);
        Ok(())
    }

    /// Receive the frames stream `index` of call `id` plays out. At most
    /// `capacity` frames wait in the channel; the rest are counted as
    /// playout overruns.
    pub fn media_sink(&mut self, id: &CallId, index: usize, capacity: usize) -> Result<mpsc::Receiver<MediaFrame>> {
        let stream = self
            .call_mut(id)?
            .stream_mut(index)
            .ok_or_else(|| CallError::invalid_input(format!("call {} has no stream {}", id, index)))?;
        let (tx, rx) = mpsc::channel(capacity.max(1));
        stream.set_sink(tx);
        Ok(rx)
    }

    // ---- internals ----

    /// Remove a call, release its media and tell subscribers. The closed
    /// event goes out only after the call is gone.
    fn close_call(&mut self, id: &CallId, code: u16, reason: &str, notify_peer: bool) {
        let Some(mut call) = self.ctx.remove_call(id) else {
            debug!(call_id = %id, "close: call already gone");
            return;
        };

        if notify_peer && call.is_signaled() {
            if let Some(ua) = self.ctx.find_ua(call.aor()) {
                if let Err(e) = self.ctx.uas[ua].signaling().hangup(id, code, reason) {
                    warn!(call_id = %id, "hangup failed: {}", e);
                }
            }
        }

        let established = call.state().is_established();
        let direction = call.direction();
        let aor = call.aor().to_string();
        let transferor = call.transferor().cloned();
        call.terminate();
        drop(call);
        info!(call_id = %id, code, reason, "call closed");

        if let Some(transferor) = transferor {
            if !established {
                let code = if (300..700).contains(&code) { code } else { CODE_SERVER_ERROR };
                self.notify_transferor(&transferor, code, reason);
            }
        }

        self.emit(UaEvent::CallClosed {
            call: id.clone(),
            aor: aor.clone(),
            direction,
            code,
            reason: reason.to_string(),
        });

        match self.redial.on_closed(&aor, direction, code) {
            RedialDecision::Redial {
                attempt,
                delay,
                aor,
                target,
            } => {
                self.redial_pending = Some((aor, target.clone()));
                self.redial_timer
                    .start(delay, &self.tx, |generation| LoopEvent::Redial { generation });
                self.emit(UaEvent::Redialing { attempt, target });
            }
            RedialDecision::GiveUp { attempts } => {
                debug!(attempts, "redial chain ended");
                self.redial_pending = None;
            }
            RedialDecision::None => {}
        }
    }

    fn on_established(&mut self, id: &CallId) {
        self.redial.reset();
        self.redial_timer.cancel();
        self.redial_pending = None;

        let Some(call) = self.ctx.call(id) else {
            return;
        };
        let peer = call.peer().to_string();
        let transferor = call.transferor().cloned();
        if let Some(transferor) = transferor {
            self.notify_transferor(&transferor, 200, "OK");
        }
        self.emit(UaEvent::CallEstablished { call: id.clone(), peer });
    }

    fn notify_transferor(&mut self, transferor: &CallId, code: u16, reason: &str) {
        match self.ctx.call_and_signaling(transferor) {
            Ok((_, signaling)) => {
                if let Err(e) = signaling.notify_sipfrag(transferor, code, reason) {
                    warn!(call_id = %transferor, "sipfrag {} failed: {}", code, e);
                }
            }
            Err(_) => debug!(call_id = %transferor, "transferor gone, no sipfrag"),
        }
    }

    fn on_local_timeout(&mut self, id: &CallId, generation: u64) {
        let Some(call) = self.ctx.call_mut(id) else {
            return;
        };
        if !call.on_local_timeout(generation) {
            return;
        }
        info!(call_id = %id, state = %call.state(), "call expired without answer");
        self.close_call(id, CALL_CODE_LOCAL_TIMEOUT, "Expired without answer", true);
    }

    fn on_redial_timer(&mut self, generation: u64) {
        if !self.redial_timer.expire(generation) {
            return;
        }
        let Some((aor, target)) = self.redial_pending.take() else {
            return;
        };
        info!(attempt = self.redial.current_attempts(), "redialing {}", target);
        if let Err(e) = self.dial(Some(&aor), &target, VideoMode::On, Vec::new(), None) {
            warn!("redial to {} failed: {}", target, e);
        }
    }

    fn handle_signaling(&mut self, aor: &str, event: SignalingEvent) -> Result<()> {
        match event {
            SignalingEvent::Incoming { call, from, media } => self.on_incoming(aor, call, from, media),
            SignalingEvent::Ringing { call: id } => {
                let call = self.call_mut(&id)?;
                if call.set_state(CallState::Ringing)? {
                    self.emit(UaEvent::CallRinging { call: id });
                }
                Ok(())
            }
            SignalingEvent::Progress { call: id, media } => {
                let call = self.call_mut(&id)?;
                call.apply_remote(&media)?;
                let changed = call.set_state(CallState::Early)?;
                call.start_streams();
                if changed {
                    self.emit(UaEvent::CallProgress { call: id });
                }
                Ok(())
            }
            SignalingEvent::Established { call: id, media } => {
                let call = self.call_mut(&id)?;
                if call.state().is_established() {
                    trace!(call_id = %id, "already established");
                    return Ok(());
                }
                if !media.is_empty() {
                    call.apply_remote(&media)?;
                }
                call.set_state(CallState::Established)?;
                call.start_streams();
                info!(call_id = %id, "call established");
                self.on_established(&id);
                Ok(())
            }
            SignalingEvent::Closed { call, code, reason } => {
                self.close_call(&call, code, &reason, false);
                Ok(())
            }
            SignalingEvent::Transfer { call, uri } => {
                self.call_mut(&call)?;
                self.emit(UaEvent::CallTransfer {
                    call: call.clone(),
                    uri: uri.clone(),
                });
                self.transfer(&call, &uri).map(|_| ())
            }
            SignalingEvent::TransferFailed { call, reason } => {
                self.emit(UaEvent::CallTransferFailed { call, reason });
                Ok(())
            }
            SignalingEvent::Dtmf { call, key } => {
                self.call_mut(&call)?;
                self.emit(UaEvent::Dtmf { call, key });
                Ok(())
            }
        }
    }

    fn call_mut(&mut self, id: &CallId) -> Result<&mut Call> {
        self.ctx
            .call_mut(id)
            .ok_or_else(|| CallError::CallNotFound(id.to_string()))
    }

    fn on_incoming(&mut self, aor: &str, id: CallId, from: String, media: Vec<RemoteMedia>) -> Result<()> {
        let ua = self
            .ctx
            .find_ua(aor)
            .ok_or_else(|| CallError::UserAgentNotFound(aor.to_string()))?;

        if self.ctx.call_count() >= self.config.call.max_calls as usize {
            warn!(call_id = %id, max_calls = self.config.call.max_calls, "rejecting call from {}: too many calls", from);
            return self.ctx.uas[ua].signaling().hangup(&id, CODE_BUSY, "Max Calls");
        }
        if self.ctx.call(&id).is_some() {
            return Err(CallError::invalid_input(format!("duplicate call id {}", id)));
        }

        let mut call = match self.prepare_incoming(ua, &id, &from, &media) {
            Ok(call) => call,
            Err(e) => {
                warn!(call_id = %id, "cannot accept call from {}: {}", from, e);
                return self.ctx.uas[ua].signaling().hangup(&id, CODE_SERVER_ERROR, "Server Internal Error");
            }
        };
        call.mark_signaled();
        call.set_state(CallState::Incoming)?;
        if let Some(timeout) = self.config.call.local_timeout {
            call.arm_local_timeout(timeout, &self.tx);
        }

        let aor = call.aor().to_string();
        info!(call_id = %id, aor = %aor, linenum = call.linenum(), "incoming call from {}", from);
        self.ctx.insert_call(call);
        self.emit(UaEvent::CallIncoming { call: id, aor, peer: from });
        Ok(())
    }

    fn prepare_incoming(&self, ua: usize, id: &CallId, from: &str, media: &[RemoteMedia]) -> Result<Call> {
        let (mnat, menc) = self.ctx.strategies(ua)?;
        let linenum = self.ctx.alloc_linenum()?;
        let video = if media.iter().any(|m| m.kind == MediaKind::Video) {
            VideoMode::On
        } else {
            VideoMode::Off
        };
        let mut call = Call::new(id.clone(), self.ctx.uas[ua].aor(), from, CallDirection::Incoming, linenum);
        call.alloc_media(&self.stream_cfg, self.config.media_laddr, video, mnat, menc, &self.media_tx)?;
        call.apply_remote(media)?;
        Ok(call)
    }

    fn handle_media_event(&mut self, event: MediaEvent) {
        let id = CallId::from(event.owner());
        let Some(call) = self.ctx.call_mut(&id) else {
            trace!(call_id = %id, "media event for a closed call");
            return;
        };

        let notify = match event {
            MediaEvent::Rtp { tag, data, src } => {
                let Some(stream) = call.stream_mut(tag.index) else {
                    return;
                };
                match stream.receive_rtp(data, src, Instant::now()) {
                    Ok(outcome) => {
                        trace!(stream = %tag, delivered = outcome.delivered.len(), "RTP received");
                        outcome
                            .established
                            .then(|| UaEvent::RtpEstablished { call: id, index: tag.index })
                    }
                    Err(e) => {
                        debug!(stream = %tag, "dropping RTP packet: {}", e);
                        None
                    }
                }
            }
            MediaEvent::Rtcp { tag, data, src } => {
                if let Some(stream) = call.stream_mut(tag.index) {
                    stream.receive_rtcp(&data, src);
                }
                None
            }
            MediaEvent::RtpTimeout { tag, generation } => call
                .stream_mut(tag.index)
                .and_then(|stream| stream.on_rtp_timeout(generation))
                .map(|err| UaEvent::CallError {
                    call: id,
                    kind: media_kind(&err),
                    reason: err.to_string(),
                }),
            MediaEvent::MnatConnected {
                tag,
                rtp_addr,
                rtcp_addr,
            } => {
                if let Some(stream) = call.stream_mut(tag.index) {
                    if stream.on_mnat_connected(rtp_addr, rtcp_addr) {
                        debug!(stream = %tag, "media flowing after NAT traversal");
                    }
                }
                None
            }
            MediaEvent::Menc { tag, event, param } => {
                if let Some(stream) = call.stream_mut(tag.index) {
                    if stream.on_menc_event(event, &param) {
                        debug!(stream = %tag, "media flowing after encryption setup");
                    }
                }
                Some(UaEvent::MediaEncryption { call: id, event, param })
            }
            MediaEvent::MencError { tag, reason } => {
                warn!(stream = %tag, "media encryption error: {}", reason);
                Some(UaEvent::CallError {
                    call: id,
                    kind: ErrorKind::ProtocolNegotiation,
                    reason,
                })
            }
            MediaEvent::MnatSessionFailed { reason, .. } | MediaEvent::MencSessionFailed { reason, .. } => {
                warn!(call_id = %id, "media negotiation failed: {}", reason);
                Some(UaEvent::CallError {
                    call: id,
                    kind: ErrorKind::ProtocolNegotiation,
                    reason,
                })
            }
        };

        if let Some(event) = notify {
            self.emit(event);
        }
    }

    fn housekeeping(&mut self, now: Instant) {
        for call in self.ctx.calls.values_mut() {
            call.sample_metrics(now);
        }
    }
}
