//! Dispatchers: run notifications on the context that owns the observers.
//!
//! The receive task of a controller computes new axis state, but observers
//! (a UI, a logger, a CLI printer) may need to see the update on their own
//! context. The engine therefore never notifies directly; it hands a [`Job`]
//! to the injected [`Dispatcher`].
//!
//! - [`InlineDispatcher`] runs the job immediately on the calling task. This
//!   is the default for headless hosts and tests.
//! - [`QueueDispatcher`] enqueues the job; the owning context pumps the
//!   paired [`DispatchQueue`] with [`DispatchQueue::run_pending`] (a frame
//!   loop) or [`DispatchQueue::run`] (a dedicated task).

use std::sync::Arc;
use tokio::sync::mpsc;

/// A unit of work posted to a dispatcher.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Posts work to the context that owns observers.
pub trait Dispatcher: Send + Sync + std::fmt::Debug {
    /// Schedule `job`. Implementations must not block.
    fn post(&self, job: Job);
}

/// Runs every job immediately on the posting task.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineDispatcher;

impl Dispatcher for InlineDispatcher {
    fn post(&self, job: Job) {
        job();
    }
}

/// Shared handle to the default inline dispatcher.
pub fn inline() -> Arc<dyn Dispatcher> {
    Arc::new(InlineDispatcher)
}

/// Enqueues jobs for a [`DispatchQueue`] to run later.
#[derive(Debug, Clone)]
pub struct QueueDispatcher {
    tx: mpsc::UnboundedSender<Job>,
}

/// Receiving side of a [`QueueDispatcher`].
pub struct DispatchQueue {
    rx: mpsc::UnboundedReceiver<Job>,
}

impl std::fmt::Debug for DispatchQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchQueue").finish_non_exhaustive()
    }
}

impl QueueDispatcher {
    /// Create a dispatcher and the queue its jobs land in.
    pub fn new() -> (Self, DispatchQueue) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, DispatchQueue { rx })
    }
}

impl Dispatcher for QueueDispatcher {
    fn post(&self, job: Job) {
        if self.tx.send(job).is_err() {
            tracing::trace!("dispatch queue closed; dropping job");
        }
    }
}

impl DispatchQueue {
    /// Run every job queued so far without waiting. Returns how many ran.
    pub fn run_pending(&mut self) -> usize {
        let mut ran = 0;
        while let Ok(job) = self.rx.try_recv() {
            job();
            ran += 1;
        }
        ran
    }

    /// Run jobs as they arrive until every dispatcher handle is dropped.
    pub async fn run(mut self) {
        while let Some(job) = self.rx.recv().await {
            job();
        }
    }
}
