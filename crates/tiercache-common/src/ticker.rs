//! Periodic background task owned by a cache instance
//!
//! The task runs on its own thread and is stopped when the [`Ticker`] is
//! dropped. Shutdown is delivered over a channel, so dropping does not wait
//! for a full interval to elapse.

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use std::io;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

/// Handle to a running periodic task
pub struct Ticker {
    name: String,
    shutdown: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Ticker {
    /// Spawn a thread that calls `tick` every `interval`
    ///
    /// The task stops when `tick` returns false or the handle is dropped.
    pub fn spawn<F>(name: impl Into<String>, interval: Duration, mut tick: F) -> io::Result<Self>
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let name = name.into();
        let (tx, rx): (Sender<()>, Receiver<()>) = bounded(1);

        let thread_name = name.clone();
        let handle = thread::Builder::new().name(name.clone()).spawn(move || {
            debug!("{} started (interval {:?})", thread_name, interval);
            loop {
                match rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        if !tick() {
                            break;
                        }
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            debug!("{} stopped", thread_name);
        })?;

        Ok(Self {
            name,
            shutdown: Some(tx),
            handle: Some(handle),
        })
    }

    /// Thread name of the task
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stop the task and wait for it to exit
    pub fn stop(&mut self) {
        // Disconnecting wakes the thread immediately
        self.shutdown.take();

        if let Some(handle) = self.handle.take() {
            // The owner may be dropped from inside its own tick
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                warn!("{} panicked", self.name);
            }
        }
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.stop();
    }
}
