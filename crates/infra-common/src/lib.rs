//! Shared infrastructure for the rsua crates.
//!
//! - [`logging`]: `tracing` subscriber setup
//! - [`config`]: the [`Conf`](config::Conf) typed lookup collaborator
//! - [`timer`]: generation-tagged one-shot timers for the event loop

pub mod config;
pub mod errors;
pub mod logging;
pub mod timer;

pub use config::{Conf, ConfMap, Range};
pub use errors::types::{Error, Result};
pub use logging::setup::{LoggingConfig, parse_log_level, setup_logging};
pub use timer::Timer;
