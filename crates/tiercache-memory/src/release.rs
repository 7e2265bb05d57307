//! Deferred release of evicted values
//!
//! Dropping a large cached value (a decoded image, a big buffer) can take
//! long enough to stall the thread that evicted it. The releaser moves that
//! drop onto a dedicated thread.

use crossbeam_channel::{Sender, unbounded};
use std::io;
use std::thread::{self, JoinHandle};
use tracing::warn;

type Garbage = Box<dyn Send>;

/// Background thread that drops whatever it is sent
pub(crate) struct Releaser {
    tx: Option<Sender<Garbage>>,
    handle: Option<JoinHandle<()>>,
}

impl Releaser {
    pub(crate) fn spawn(name: &str) -> io::Result<Self> {
        let (tx, rx) = unbounded::<Garbage>();
        let handle = thread::Builder::new()
            .name(format!("{name}-release"))
            .spawn(move || {
                for garbage in rx {
                    drop(garbage);
                }
            })?;
        Ok(Self {
            tx: Some(tx),
            handle: Some(handle),
        })
    }

    /// Hand a value over to the release thread
    ///
    /// Falls back to dropping on the caller's thread if the release thread
    /// is gone.
    pub(crate) fn release(&self, garbage: Garbage) {
        match &self.tx {
            Some(tx) => {
                if let Err(e) = tx.send(garbage) {
                    drop(e.into_inner());
                }
            }
            None => drop(garbage),
        }
    }
}

impl Drop for Releaser {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                warn!("release thread panicked");
            }
        }
    }
}
