//! A dedicated thread owning a foreign API's current context.
//!
//! GL contexts are current on one thread only, so every native call touching a
//! GL resource is shipped to that thread and the caller blocks for the result.

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

use crossbeam_channel::{bounded, unbounded, Sender};

use crate::error::{FrameError, Result};
use crate::fp_emit;
use crate::sync::mutex::Mutex;

type Task = Box<dyn FnOnce() + Send>;

struct WorkerInner {
    name: String,
    thread_id: ThreadId,
    sender: Mutex<Option<Sender<Task>>>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for WorkerInner {
    fn drop(&mut self) {
        // Disconnecting the channel ends the worker loop
        drop(self.sender.lock().take());
        let join = self.join.lock().take();
        if let Some(join) = join {
            if thread::current().id() != self.thread_id && join.join().is_err() {
                log::warn!("{}: worker panicked", self.name);
            }
        }
    }
}

/// Handle to a context thread. Clones share the thread, which exits when
/// the last clone is dropped.
#[derive(Clone)]
pub struct ContextThread {
    inner: Arc<WorkerInner>,
}

impl ContextThread {
    /// Start a worker thread named `name`.
    pub fn spawn(name: &str) -> io::Result<Self> {
        let (sender, receiver) = unbounded::<Task>();
        let join = thread::Builder::new().name(name.to_string()).spawn(move || {
            for task in receiver {
                // A panicking task drops its result sender, which the caller sees
                let _ = panic::catch_unwind(AssertUnwindSafe(task));
            }
        })?;

        log::debug!("{}: context thread started", name);
        Ok(Self {
            inner: Arc::new(WorkerInner {
                name: name.to_string(),
                thread_id: join.thread().id(),
                sender: Mutex::new(Some(sender)),
                join: Mutex::new(Some(join)),
            }),
        })
    }

    /// Thread name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Id of the worker thread.
    pub fn thread_id(&self) -> ThreadId {
        self.inner.thread_id
    }

    /// Whether the caller is the worker thread.
    pub fn is_current(&self) -> bool {
        thread::current().id() == self.inner.thread_id
    }

    /// Run `task` on the worker and wait for its result.
    ///
    /// Runs inline when called from the worker itself.
    pub fn run<R, F>(&self, task: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        if self.is_current() {
            return Ok(task());
        }

        let (result_tx, result_rx) = bounded(1);
        let job: Task = Box::new(move || {
            let _ = result_tx.send(task());
        });

        let sender = self.inner.sender.lock().clone();
        let sent = match sender {
            Some(sender) => sender.send(job).is_ok(),
            None => false,
        };
        if !sent {
            return Err(self.gone());
        }
        result_rx.recv().map_err(|_| self.gone())
    }

    fn gone(&self) -> FrameError {
        fp_emit!(FP403, self.inner.name.clone());
        FrameError::InteropUnavailable(format!("{} is not running", self.inner.name))
    }
}

impl std::fmt::Debug for ContextThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextThread")
            .field("name", &self.inner.name)
            .field("thread_id", &self.inner.thread_id)
            .finish()
    }
}
