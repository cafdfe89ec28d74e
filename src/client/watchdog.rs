//! Router liveness supervision

use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::router::Router;
use crate::Result;

/// How often the router is checked
pub const CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Restarts stalled router pumps; falls back to direct replies when a
/// restart is impossible
pub struct Watchdog {
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl Watchdog {
    /// Start checking `router` every `interval`
    ///
    /// # Errors
    ///
    /// Returns error if the thread cannot be spawned
    pub fn start(router: Arc<Router>, interval: Duration, max_age: Duration) -> Result<Self> {
        let (stop, stopped) = mpsc::channel::<()>();
        let thread = thread::Builder::new()
            .name("router-watchdog".into())
            .spawn(move || {
                loop {
                    match stopped.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => check(&router, max_age),
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            })?;

        Ok(Self {
            stop: Some(stop),
            thread: Some(thread),
        })
    }

    pub fn stop(&mut self) {
        self.stop.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.stop();
    }
}

/// One supervision pass
pub fn check(router: &Router, max_age: Duration) {
    if router.is_direct() {
        return;
    }
    for channel in router.stalled_channels(max_age) {
        tracing::warn!(%channel, "router pump stalled");
        if let Err(e) = router.restart(channel) {
            tracing::error!(%channel, error = %e, "router pump restart failed");
            router.enter_direct_mode();
            return;
        }
    }
}
