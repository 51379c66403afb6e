//! The serial execution lane that owns drawing and completion delivery.
//!
//! Rasterization is not safe to run concurrently, and callers expect
//! completions on one known context. Both are satisfied by a single named
//! thread that runs submitted closures one at a time, in submission order.

use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{JoinHandle, ThreadId};

use overlaykit_common::error::{OverlayKitError, OverlayKitResult};

type Job = Box<dyn FnOnce() + Send + 'static>;

struct Lane {
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    thread_id: ThreadId,
    handle: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to a serial execution lane. Clones share the same lane.
#[derive(Clone)]
pub struct MainContext {
    lane: Arc<Lane>,
}

impl std::fmt::Debug for MainContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MainContext")
            .field("thread_id", &self.lane.thread_id)
            .finish()
    }
}

impl MainContext {
    /// Start a lane on a new thread called `name`.
    pub fn spawn(name: &str) -> OverlayKitResult<Self> {
        let (sender, receiver) = mpsc::channel::<Job>();
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                while let Ok(job) = receiver.recv() {
                    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
                        tracing::error!(
                            panic = panic_message(payload.as_ref()),
                            "Main context job panicked"
                        );
                    }
                }
                tracing::debug!("Main context drained");
            })?;

        Ok(Self {
            lane: Arc::new(Lane {
                sender: Mutex::new(Some(sender)),
                thread_id: handle.thread().id(),
                handle: Mutex::new(Some(handle)),
            }),
        })
    }

    /// Whether the calling thread is this lane.
    pub fn is_current(&self) -> bool {
        std::thread::current().id() == self.lane.thread_id
    }

    /// Queue `job` to run on the lane.
    pub fn dispatch(&self, job: impl FnOnce() + Send + 'static) -> OverlayKitResult<()> {
        let sender = self
            .lane
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match sender.as_ref() {
            Some(tx) => tx
                .send(Box::new(job))
                .map_err(|_| OverlayKitError::ContextClosed),
            None => Err(OverlayKitError::ContextClosed),
        }
    }

    /// Run `job` on the lane and wait for its result.
    ///
    /// Runs inline when already on the lane, so nested calls cannot deadlock.
    /// A panic inside `job` is resumed on the calling thread and the lane
    /// keeps running.
    pub fn run_sync<R: Send + 'static>(
        &self,
        job: impl FnOnce() -> R + Send + 'static,
    ) -> OverlayKitResult<R> {
        if self.is_current() {
            return Ok(job());
        }
        let (tx, rx) = mpsc::sync_channel(1);
        self.dispatch(move || {
            let _ = tx.send(panic::catch_unwind(AssertUnwindSafe(job)));
        })?;
        match rx.recv() {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(payload)) => panic::resume_unwind(payload),
            Err(_) => Err(OverlayKitError::ContextClosed),
        }
    }

    /// Stop accepting work, drain what is queued and join the thread.
    pub fn shutdown(&self) {
        self.lane
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if self.is_current() {
            return;
        }
        let handle = self
            .lane
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::warn!("Main context thread panicked");
            }
        }
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

impl Drop for Lane {
    fn drop(&mut self) {
        self.sender
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let handle = self
            .handle
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if std::thread::current().id() != self.thread_id && handle.join().is_err() {
                tracing::warn!("Main context thread panicked");
            }
        }
    }
}
