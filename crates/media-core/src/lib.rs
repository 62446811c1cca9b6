//! Media plane for rsua.
//!
//! A [`Stream`] carries one media line of a call. It owns the RTP transport,
//! the jitter buffer and the per-media state of the NAT-traversal and
//! encryption strategies, and it only transmits once every configured gate
//! has opened. Everything asynchronous (received datagrams, strategy
//! callbacks, timer expiry) reaches the owner as a [`MediaEvent`] on the
//! event loop's channel.

pub mod device;
pub mod error;
pub mod events;
pub mod jitter;
pub mod menc;
pub mod mnat;
pub mod registry;
pub mod stream;
pub mod types;

pub use device::{DeviceThread, FrameSource};
pub use error::{MediaError, Result};
pub use events::{MediaEvent, MediaEventSender};
pub use jitter::{JitterBuffer, JitterBufferConfig, JitterBufferStats, JitterBufferType, PutError};
pub use menc::{MediaEncryption, MencEvent, MencMedia, MencNotifier, MencRegistry, MencSession, MencSessionNotifier};
pub use mnat::{MediaNat, MnatMedia, MnatNotifier, MnatRegistry, MnatSession, MnatSessionNotifier};
pub use registry::{Named, Registry};
pub use stream::{ReceiveOutcome, Stream, StreamConfig, StreamParams, VIDEO_MAX_PAYLOAD};
pub use types::{LocalMedia, MediaDirection, MediaFrame, MediaKind, RemoteMedia, StreamTag};
