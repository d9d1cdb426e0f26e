//! Serialized access to the embedding backend.
//!
//! The [`EmbeddingGate`] is a single-consumer FIFO queue in front of one
//! [`EmbeddingBackend`]. Any number of callers may `embed` concurrently;
//! the worker runs exactly one inference at a time, in arrival order, and
//! answers each request on its own channel, so one failure never affects
//! the requests queued behind it.
//!
//! Requests are rejected up front, without queueing, when no backend is
//! registered, when the text is blank, or when the bounded queue is full.
//! Every accepted request resolves within the configured timeout.

use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use crate::config::EmbeddingConfig;
use crate::embedding::EmbeddingBackend;
use crate::error::EmbeddingError;

type Reply = oneshot::Sender<Result<Vec<f32>, EmbeddingError>>;

struct EmbedJob {
    text: String,
    backend: Arc<dyn EmbeddingBackend>,
    reply: Reply,
}

enum JobSender {
    Bounded(mpsc::Sender<EmbedJob>),
    Unbounded(mpsc::UnboundedSender<EmbedJob>),
}

enum JobReceiver {
    Bounded(mpsc::Receiver<EmbedJob>),
    Unbounded(mpsc::UnboundedReceiver<EmbedJob>),
}

impl JobReceiver {
    async fn recv(&mut self) -> Option<EmbedJob> {
        match self {
            JobReceiver::Bounded(rx) => rx.recv().await,
            JobReceiver::Unbounded(rx) => rx.recv().await,
        }
    }
}

pub struct EmbeddingGate {
    backend: RwLock<Option<Arc<dyn EmbeddingBackend>>>,
    sender: JobSender,
    dims: usize,
    timeout: Duration,
}

impl EmbeddingGate {
    /// Create the gate and spawn its worker on the current tokio runtime.
    ///
    /// `queue_capacity == 0` leaves the queue unbounded.
    pub fn new(dims: usize, queue_capacity: usize, timeout: Duration) -> Self {
        let (sender, receiver) = if queue_capacity == 0 {
            let (tx, rx) = mpsc::unbounded_channel();
            (JobSender::Unbounded(tx), JobReceiver::Unbounded(rx))
        } else {
            let (tx, rx) = mpsc::channel(queue_capacity);
            (JobSender::Bounded(tx), JobReceiver::Bounded(rx))
        };

        tokio::spawn(run_worker(receiver, dims));

        Self {
            backend: RwLock::new(None),
            sender,
            dims,
            timeout,
        }
    }

    pub fn from_config(config: &EmbeddingConfig) -> Self {
        Self::new(config.dims, config.queue_capacity, config.timeout())
    }

    /// Install the backend all later requests run against.
    pub fn register_backend(&self, backend: Arc<dyn EmbeddingBackend>) -> Result<(), EmbeddingError> {
        if backend.dims() != self.dims {
            return Err(EmbeddingError::Dimension {
                expected: self.dims,
                actual: backend.dims(),
            });
        }
        tracing::info!(model = backend.model_name(), dims = self.dims, "embedding backend registered");
        *self
            .backend
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(backend);
        Ok(())
    }

    /// Remove the backend. Requests already queued still complete.
    pub fn unregister_backend(&self) {
        *self
            .backend
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
    }

    pub fn is_ready(&self) -> bool {
        self.current_backend().is_some()
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    fn current_backend(&self) -> Option<Arc<dyn EmbeddingBackend>> {
        self.backend
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Embed `text`, waiting for every earlier request to finish first.
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(EmbeddingError::EmptyInput);
        }
        let backend = self.current_backend().ok_or(EmbeddingError::NotReady)?;

        let (reply, response) = oneshot::channel();
        let job = EmbedJob {
            text: text.to_string(),
            backend,
            reply,
        };

        match &self.sender {
            JobSender::Bounded(tx) => tx.try_send(job).map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => EmbeddingError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => EmbeddingError::Closed,
            })?,
            JobSender::Unbounded(tx) => tx.send(job).map_err(|_| EmbeddingError::Closed)?,
        }

        match tokio::time::timeout(self.timeout, response).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(EmbeddingError::Closed),
            Err(_) => Err(EmbeddingError::Timeout),
        }
    }
}

async fn run_worker(mut receiver: JobReceiver, dims: usize) {
    while let Some(job) = receiver.recv().await {
        // The caller gave up (timeout or dropped future); skip the work.
        if job.reply.is_closed() {
            continue;
        }

        let EmbedJob {
            text,
            backend,
            reply,
        } = job;

        let result = match tokio::task::spawn_blocking(move || backend.embed(&text)).await {
            Ok(result) => result,
            Err(e) => Err(EmbeddingError::Backend(format!("embedding task failed: {}", e))),
        };
        let result = result.and_then(|vector| {
            if vector.len() == dims {
                Ok(vector)
            } else {
                Err(EmbeddingError::Dimension {
                    expected: dims,
                    actual: vector.len(),
                })
            }
        });

        if let Err(ref e) = result {
            tracing::warn!(error = %e, "embedding request failed");
        }
        let _ = reply.send(result);
    }
    tracing::debug!("embedding worker stopped");
}
