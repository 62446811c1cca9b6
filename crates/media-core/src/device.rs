//! Bridge between blocking device I/O and the event loop.
//!
//! Capture and playback backends run on their own OS threads. A
//! [`DeviceThread`] pulls frames from a [`FrameSource`] at a fixed pace and
//! hands them to the loop through a bounded channel. When the loop falls
//! behind, frames are dropped and counted as overruns; the device thread
//! never blocks on the loop.
//!
//! Shutdown is cooperative: [`DeviceThread::stop`] clears the run flag and
//! joins the thread, so no frame is produced once it returns.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use crate::error::{MediaError, Result};

/// A blocking producer of media frames
pub trait FrameSource: Send + 'static {
    type Frame: Send + 'static;

    /// Next frame. `Ok(None)` means the source is exhausted.
    fn read_frame(&mut self) -> Result<Option<Self::Frame>>;
}

#[derive(Debug, Default)]
struct Shared {
    run: AtomicBool,
    frames: AtomicU64,
    overruns: AtomicU64,
    last_error: Mutex<Option<MediaError>>,
}

pub struct DeviceThread {
    name: String,
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl DeviceThread {
    /// Start `source` on a new thread, reading one frame every `ptime`.
    ///
    /// Returns the handle and the receiving end of a channel holding at most
    /// `capacity` frames.
    pub fn spawn<S: FrameSource>(
        name: impl Into<String>,
        source: S,
        ptime: Duration,
        capacity: usize,
    ) -> Result<(Self, mpsc::Receiver<S::Frame>)> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let dev = Self::spawn_with(name, source, ptime, tx, |frame| frame)?;
        Ok((dev, rx))
    }

    /// Like [`spawn`](Self::spawn), but feeds an existing channel. `wrap`
    /// turns each frame into the channel's item, so several devices can
    /// share one consumer.
    pub fn spawn_with<S, T, F>(
        name: impl Into<String>,
        mut source: S,
        ptime: Duration,
        tx: mpsc::Sender<T>,
        wrap: F,
    ) -> Result<Self>
    where
        S: FrameSource,
        T: Send + 'static,
        F: Fn(S::Frame) -> T + Send + 'static,
    {
        let name = name.into();
        let shared = Arc::new(Shared::default());
        shared.run.store(true, Ordering::SeqCst);

        let thread_shared = shared.clone();
        let thread_name = name.clone();
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let mut next = Instant::now() + ptime;
                while thread_shared.run.load(Ordering::SeqCst) {
                    match source.read_frame() {
                        Ok(Some(frame)) => match tx.try_send(wrap(frame)) {
                            Ok(()) => {
                                thread_shared.frames.fetch_add(1, Ordering::Relaxed);
                            }
                            Err(TrySendError::Full(_)) => {
                                thread_shared.overruns.fetch_add(1, Ordering::Relaxed);
                            }
                            Err(TrySendError::Closed(_)) => break,
                        },
                        Ok(None) => {
                            debug!(device = %thread_name, "source exhausted");
                            break;
                        }
                        Err(e) => {
                            warn!(device = %thread_name, "read failed: {}", e);
                            *thread_shared.last_error.lock() = Some(e);
                            break;
                        }
                    }

                    let now = Instant::now();
                    if now < next {
                        thread::sleep(next - now);
                        next += ptime;
                    } else {
                        next = now + ptime;
                    }
                }
                thread_shared.run.store(false, Ordering::SeqCst);
            })
            .map_err(|e| MediaError::ResourceExhaustion(format!("device thread {}: {}", name, e)))?;

        debug!(device = %name, ?ptime, "device thread started");
        Ok(Self {
            name,
            shared,
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the thread is still producing
    pub fn is_running(&self) -> bool {
        self.shared.run.load(Ordering::SeqCst)
    }

    pub fn frames(&self) -> u64 {
        self.shared.frames.load(Ordering::Relaxed)
    }

    /// Frames dropped because the channel was full
    pub fn overruns(&self) -> u64 {
        self.shared.overruns.load(Ordering::Relaxed)
    }

    /// The error that stopped the thread, if any
    pub fn last_error(&self) -> Option<MediaError> {
        self.shared.last_error.lock().clone()
    }

    /// Clear the run flag and wait for the thread to exit
    pub fn stop(&mut self) {
        self.shared.run.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!(device = %self.name, "device thread panicked");
            }
            debug!(device = %self.name, frames = self.frames(), overruns = self.overruns(), "device thread stopped");
        }
    }
}

impl Drop for DeviceThread {
    fn drop(&mut self) {
        self.stop();
    }
}
