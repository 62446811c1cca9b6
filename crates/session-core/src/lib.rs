//! Call control for rsua.
//!
//! This crate holds the call state machine, the user-agent context with its
//! strategy registries, the redial policy and the single event loop that
//! drives them all. Signaling is consumed through the [`Signaling`] trait;
//! media comes from `rsua-media-core`.
//!
//! ```no_run
//! use rsua_infra_common::ConfMap;
//! use rsua_session_core::{Engine, VideoMode};
//!
//! # async fn example() -> rsua_session_core::Result<()> {
//! let conf = ConfMap::new().with("call_max_calls", "2");
//! let mut engine = Engine::from_conf(&conf);
//! let handle = engine.handle();
//! tokio::spawn(async move { engine.run().await });
//!
//! let call = handle.connect("sip:bob@example.com", VideoMode::Off).await?;
//! handle.hangup(&call, 0, "").await?;
//! # Ok(())
//! # }
//! ```

pub mod call;
pub mod config;
pub mod engine;
pub mod errors;
pub mod events;
pub mod redial;
pub mod signaling;
pub mod types;
pub mod ua;

pub use call::Call;
pub use config::{AvtConfig, CallConfig, CoreConfig, RedialConfig};
pub use engine::{Engine, EngineHandle, FRAME_QUEUE_CAPACITY, HOUSEKEEPING_INTERVAL};
pub use errors::{CallError, ErrorKind, Result};
pub use events::{UaEvent, UaEventReceiver};
pub use redial::{RedialAttempts, RedialDecision, RedialPolicy};
pub use signaling::{Signaling, SignalingEvent, SignalingEventSender};
pub use types::{
    CALL_CODE_LOCAL_TIMEOUT, CALL_LINENUM_MAX, CALL_LINENUM_MIN, CallDirection, CallId, CallInfo, CallState,
    CustomHeader, VideoMode,
};
pub use ua::{UaConfig, UaContext, UserAgent};
