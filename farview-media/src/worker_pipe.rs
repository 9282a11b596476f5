//! Background offload: run a contiguous pipe sub-chain on its own task.
//!
//! The boundary is a single ordered channel of typed messages, so
//! submission order is preserved across the offload. Payload buffers are
//! moved, not copied. There is no backpressure — the receiving side must
//! keep up. IDR requests raised inside the offloaded chain travel back
//! through a shared flag read by `poll_request_idr`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::PipelineError;
use crate::pipe::{MediaPipe, Payload, SetupConfig};

#[derive(Debug)]
enum WorkerMessage {
    Setup(SetupConfig),
    Submit(Payload),
    Tick,
    Cleanup,
}

/// Proxy pipe whose inner chain lives on a background task.
pub struct WorkerPipe {
    tx: Option<mpsc::UnboundedSender<WorkerMessage>>,
    idr_flag: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl WorkerPipe {
    /// Move `inner` onto a background task. Requires a tokio runtime.
    ///
    /// Setup and submission errors inside the offloaded chain cannot be
    /// returned synchronously; they are logged and the chain latches
    /// errored on its own side.
    pub fn spawn(mut inner: Box<dyn MediaPipe>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<WorkerMessage>();
        let idr_flag = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&idr_flag);

        let handle = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                match message {
                    WorkerMessage::Setup(config) => {
                        if let Err(error) = inner.setup(&config) {
                            tracing::error!(%error, "offloaded chain setup failed");
                        }
                    }
                    WorkerMessage::Submit(payload) => {
                        if let Err(error) = inner.submit(payload) {
                            tracing::warn!(%error, "offloaded chain rejected a submission");
                        }
                    }
                    WorkerMessage::Tick => inner.tick(),
                    WorkerMessage::Cleanup => {
                        inner.cleanup();
                        break;
                    }
                }
                if inner.poll_request_idr() {
                    flag.store(true, Ordering::Relaxed);
                }
            }
            tracing::debug!("worker pipe task finished");
        });

        Self {
            tx: Some(tx),
            idr_flag,
            handle: Some(handle),
        }
    }

    fn send(&self, message: WorkerMessage) {
        if let Some(tx) = &self.tx {
            if tx.send(message).is_err() {
                tracing::warn!("worker pipe task is gone; message dropped");
            }
        }
    }

    /// Whether the background task has exited (after cleanup or a panic).
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(|handle| handle.is_finished())
    }
}

impl MediaPipe for WorkerPipe {
    fn setup(&mut self, config: &SetupConfig) -> Result<(), PipelineError> {
        self.send(WorkerMessage::Setup(config.clone()));
        Ok(())
    }

    fn submit(&mut self, payload: Payload) -> Result<(), PipelineError> {
        self.send(WorkerMessage::Submit(payload));
        Ok(())
    }

    fn tick(&mut self) {
        self.send(WorkerMessage::Tick);
    }

    fn poll_request_idr(&mut self) -> bool {
        self.idr_flag.swap(false, Ordering::Relaxed)
    }

    fn cleanup(&mut self) {
        self.send(WorkerMessage::Cleanup);
        self.tx = None;
        self.handle = None;
    }
}
