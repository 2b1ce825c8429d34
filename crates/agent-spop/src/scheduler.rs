//! Decouples per-connection frame reads from frame processing.
//!
//! HAProxy allows pipelining NOTIFY frames ahead of their ACKs, and a
//! handler call can take a while. A single connection task reading frames
//! off the wire must never block on handler work, so every frame is handed
//! to a small fixed pool of workers through a bounded queue. The queue's
//! capacity (`2 * num_cpus`) caps how far a fast reader can run ahead of
//! slow workers before backpressure kicks in.
//!
//! Workers may finish frames out of the order they were scheduled in —
//! HAProxy matches ACKs to NOTIFYs by stream/frame ID, not arrival order —
//! so nothing here assumes in-order completion.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use tokio::sync::{mpsc, Mutex};
use tracing::error;

use crate::frame::Frame;

/// Processes one scheduled frame to completion, including writing any
/// reply. Implementations run on a worker task and must not assume
/// exclusive access to connection state beyond what `Self` provides.
pub trait FrameProcessor: Send + Sync {
    fn process(&self, frame: Frame) -> impl Future<Output = ()> + Send;
}

/// Error returned when [`AsyncScheduler::schedule`] is called after every
/// worker has shut down.
#[derive(Debug)]
pub struct SchedulerClosed;

impl std::fmt::Display for SchedulerClosed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "scheduler is no longer accepting frames")
    }
}

impl std::error::Error for SchedulerClosed {}

/// A fixed-size worker pool reading from a single bounded queue.
pub struct AsyncScheduler {
    tx: mpsc::Sender<Frame>,
}

impl AsyncScheduler {
    /// Spawns `num_cpus::get()` workers pulling from a queue with capacity
    /// `2 * num_cpus::get()`.
    pub fn new<P>(processor: Arc<P>) -> Self
    where
        P: FrameProcessor + 'static,
    {
        Self::with_worker_count(processor, num_cpus::get().max(1))
    }

    pub fn with_worker_count<P>(processor: Arc<P>, workers: usize) -> Self
    where
        P: FrameProcessor + 'static,
    {
        let capacity = (workers * 2).max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let rx = Arc::new(Mutex::new(rx));

        for _ in 0..workers {
            let rx = rx.clone();
            let processor = processor.clone();
            tokio::spawn(async move { worker_loop(rx, processor).await });
        }

        Self { tx }
    }

    /// Enqueues `frame`, waiting for queue space if every worker is busy.
    pub async fn schedule(&self, frame: Frame) -> Result<(), SchedulerClosed> {
        self.tx.send(frame).await.map_err(|_| SchedulerClosed)
    }
}

async fn worker_loop<P: FrameProcessor + 'static>(
    rx: Arc<Mutex<mpsc::Receiver<Frame>>>,
    processor: Arc<P>,
) {
    loop {
        let frame = {
            let mut guard = rx.lock().await;
            match guard.recv().await {
                Some(f) => f,
                None => return,
            }
        };

        // Isolate a handler panic to this one frame: the worker loop keeps
        // running for the next frame regardless of what just happened.
        let result = AssertUnwindSafe(processor.process(frame)).catch_unwind().await;
        if let Err(panic) = result {
            let msg = panic_message(&panic);
            error!(panic = %msg, "spop frame handler panicked");
        }
    }
}

pub(crate) fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
