//! Serial worker queue
//!
//! One thread drains an unbounded channel of jobs. Jobs submitted from one
//! thread run in submission order; jobs from different threads interleave in
//! whatever order they reach the channel.

use crossbeam_channel::{Sender, unbounded};
use std::io;
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

type Job = Box<dyn FnOnce() + Send>;

pub(crate) struct SerialQueue {
    name: String,
    tx: Option<Sender<Job>>,
    handle: Option<JoinHandle<()>>,
}

impl SerialQueue {
    pub(crate) fn spawn(name: impl Into<String>) -> io::Result<Self> {
        let name = name.into();
        let (tx, rx) = unbounded::<Job>();
        let thread_name = name.clone();
        let handle = thread::Builder::new().name(name.clone()).spawn(move || {
            for job in rx {
                job();
            }
            debug!("{} drained", thread_name);
        })?;
        Ok(Self {
            name,
            tx: Some(tx),
            handle: Some(handle),
        })
    }

    /// Queue a job; runs it on the caller's thread if the worker is gone
    pub(crate) fn submit(&self, job: Job) {
        let Some(tx) = &self.tx else {
            job();
            return;
        };
        if let Err(e) = tx.send(job) {
            warn!("{} is gone, running job inline", self.name);
            (e.into_inner())();
        }
    }
}

impl Drop for SerialQueue {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            // The last handle to the cache may be dropped by one of its own jobs
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                warn!("{} panicked", self.name);
            }
        }
    }
}
