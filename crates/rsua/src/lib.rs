//! rsua: the media and call-control core of a SIP user agent.
//!
//! This crate ties the workspace together behind one lifecycle:
//!
//! 1. [`Rsua::init`] sets up logging and builds the engine from
//!    configuration.
//! 2. Strategies and user agents are registered.
//! 3. [`Rsua::start`] spawns the event loop.
//! 4. [`Rsua::stop`] hangs up every call and joins the loop.
//!
//! Everything in between goes through the [`EngineHandle`] returned by
//! [`Rsua::handle`].
//!
//! ```no_run
//! use rsua::{Rsua, RsuaOptions, VideoMode};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let mut ua = Rsua::init(RsuaOptions::default())?;
//! ua.start()?;
//! let call = ua.handle().connect("sip:bob@example.com", VideoMode::On).await?;
//! ua.handle().hangup(&call, 0, "").await?;
//! ua.stop().await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use rsua_infra_common::logging::setup::log_welcome;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

pub use rsua_infra_common as infra;
pub use rsua_media_core as media;
pub use rsua_rtp_core as rtp;
pub use rsua_session_core as session;

pub use rsua_infra_common::{Conf, ConfMap, LoggingConfig};
pub use rsua_media_core::{FrameSource, MediaEncryption, MediaFrame, MediaNat};
pub use rsua_session_core::{
    CallError, CallId, CallInfo, CallState, Engine, EngineHandle, Signaling, SignalingEvent, SignalingEventSender,
    UaConfig, UaEvent, UaEventReceiver, VideoMode,
};

/// Start-up options
#[derive(Debug, Clone, Default)]
pub struct RsuaOptions {
    pub log: LoggingConfig,
    pub conf: ConfMap,
    /// Stop the engine by itself after this long
    pub timeout: Option<Duration>,
}

impl RsuaOptions {
    pub fn with_conf(mut self, conf: ConfMap) -> Self {
        self.conf = conf;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Process-level owner of the engine and its loop task
pub struct Rsua {
    /// Present until the loop is started
    engine: Option<Engine>,
    handle: EngineHandle,
    timeout: Option<Duration>,
    task: Option<JoinHandle<()>>,
    quit: Option<JoinHandle<()>>,
}

impl Rsua {
    /// Build the engine. Call from inside a tokio runtime.
    pub fn init(opts: RsuaOptions) -> anyhow::Result<Self> {
        let log = opts.log.clone().apply_conf(&opts.conf).context("logging configuration")?;
        // A subscriber may already be installed by the host application
        if let Err(e) = rsua_infra_common::setup_logging(&log) {
            debug!("keeping existing tracing subscriber: {}", e);
        }
        log_welcome(&log.app_name, env!("CARGO_PKG_VERSION"));

        let engine = Engine::from_conf(&opts.conf);
        let handle = engine.handle();
        Ok(Self {
            engine: Some(engine),
            handle,
            timeout: opts.timeout,
            task: None,
            quit: None,
        })
    }

    fn engine_mut(&mut self, what: &str) -> anyhow::Result<&mut Engine> {
        match self.engine.as_mut() {
            Some(engine) => Ok(engine),
            None => bail!("cannot {} after start", what),
        }
    }

    /// Register a NAT-traversal strategy. Only possible before [`Rsua::start`].
    pub fn register_mnat(&mut self, strategy: Arc<dyn MediaNat>) -> anyhow::Result<()> {
        self.engine_mut("register media NAT")?.register_mnat(strategy);
        Ok(())
    }

    /// Register a media-encryption strategy. Only possible before
    /// [`Rsua::start`].
    pub fn register_menc(&mut self, strategy: Arc<dyn MediaEncryption>) -> anyhow::Result<()> {
        self.engine_mut("register media encryption")?.register_menc(strategy);
        Ok(())
    }

    pub async fn add_user_agent(&mut self, config: UaConfig, signaling: Box<dyn Signaling>) -> anyhow::Result<()> {
        let aor = config.aor.clone();
        match self.engine.as_mut() {
            Some(engine) => engine.add_user_agent(config, signaling),
            None => self.handle.add_user_agent(config, signaling).await,
        }
        .with_context(|| format!("adding user agent {}", aor))
    }

    /// Spawn the event loop, plus the quit timer if a timeout was given
    pub fn start(&mut self) -> anyhow::Result<()> {
        let mut engine = self.engine.take().context("engine already started")?;
        self.task = Some(tokio::spawn(async move {
            engine.run().await;
        }));

        if let Some(timeout) = self.timeout {
            let handle = self.handle.clone();
            self.quit = Some(tokio::spawn(async move {
                time::sleep(timeout).await;
                info!("quit timer expired after {:?}", timeout);
                if let Err(e) = handle.stop().await {
                    debug!("quit: {}", e);
                }
            }));
        }
        info!("rsua started");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Wait for the loop to end by itself, e.g. through the quit timer
    pub async fn wait(&mut self) -> anyhow::Result<()> {
        if let Some(task) = self.task.take() {
            task.await.context("event loop task failed")?;
        }
        if let Some(quit) = self.quit.take() {
            quit.abort();
        }
        Ok(())
    }

    /// Hang up every call, stop the loop and join it
    pub async fn stop(&mut self) -> anyhow::Result<()> {
        if let Some(quit) = self.quit.take() {
            quit.abort();
        }
        match self.task.take() {
            Some(task) => {
                if let Err(e) = self.handle.stop().await {
                    debug!("stop: {}", e);
                }
                task.await.context("event loop task failed")?;
            }
            None => {
                if let Some(engine) = self.engine.as_mut() {
                    engine.shutdown();
                } else {
                    warn!("stop: not running");
                }
            }
        }
        info!("rsua stopped");
        Ok(())
    }

    pub fn handle(&self) -> EngineHandle {
        self.handle.clone()
    }

    pub fn subscribe(&self) -> UaEventReceiver {
        self.handle.subscribe()
    }

    pub fn signaling_sender(&self, aor: impl Into<String>) -> SignalingEventSender {
        self.handle.signaling_sender(aor)
    }
}

impl Drop for Rsua {
    fn drop(&mut self) {
        if let Some(quit) = self.quit.take() {
            quit.abort();
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
