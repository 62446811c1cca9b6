//! One-shot timers for a single-task event loop.
//!
//! A [`Timer`] never runs user code on its own. When it fires, its task posts
//! an event into the loop's channel, tagged with the generation it was armed
//! with. The loop hands that generation back to [`Timer::expire`], which only
//! accepts the most recent arming. Restarting or cancelling a timer therefore
//! invalidates any event already sitting in the channel, and cancellation is
//! race-free from the loop's point of view.

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;

#[derive(Debug, Default)]
pub struct Timer {
    generation: u64,
    task: Option<JoinHandle<()>>,
}

impl Timer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the timer, replacing any pending arming.
    ///
    /// `event` builds the message posted to `tx` after `delay`; it receives the
    /// generation to pass back to [`Timer::expire`]. Returns that generation.
    pub fn start<E, F>(&mut self, delay: Duration, tx: &mpsc::UnboundedSender<E>, event: F) -> u64
    where
        E: Send + 'static,
        F: FnOnce(u64) -> E,
    {
        self.cancel();
        let generation = self.generation;
        let msg = event(generation);
        let tx = tx.clone();
        self.task = Some(tokio::spawn(async move {
            time::sleep(delay).await;
            // The loop may already be gone during shutdown.
            let _ = tx.send(msg);
        }));
        generation
    }

    pub fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.generation = self.generation.wrapping_add(1);
    }

    /// Whether the timer is armed and its event has not been accepted yet
    pub fn is_running(&self) -> bool {
        self.task.is_some()
    }

    /// Accept a fired event. Returns `false` for stale or cancelled armings.
    pub fn expire(&mut self, generation: u64) -> bool {
        if self.task.is_some() && generation == self.generation {
            self.task = None;
            true
        } else {
            false
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_fires_once_after_delay() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timer = Timer::new();
        let start = time::Instant::now();

        timer.start(Duration::from_secs(5), &tx, |g| g);
        assert!(timer.is_running());

        let generation = rx.recv().await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(5));
        assert!(timer.expire(generation));
        assert!(!timer.is_running());
        // A second acceptance of the same event is refused
        assert!(!timer.expire(generation));
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_invalidates_previous_generation() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timer = Timer::new();

        let first = timer.start(Duration::from_secs(1), &tx, |g| g);
        let second = timer.start(Duration::from_secs(2), &tx, |g| g);
        assert_ne!(first, second);
        assert!(!timer.expire(first));

        let fired = rx.recv().await.unwrap();
        assert_eq!(fired, second);
        assert!(timer.expire(fired));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_suppresses_event() {
        let (tx, mut rx) = mpsc::unbounded_channel::<u64>();
        let mut timer = Timer::new();

        let generation = timer.start(Duration::from_millis(100), &tx, |g| g);
        timer.cancel();
        assert!(!timer.is_running());

        time::sleep(Duration::from_millis(500)).await;
        tokio_test::assert_err!(rx.try_recv());
        assert!(!timer.expire(generation));
    }
}
