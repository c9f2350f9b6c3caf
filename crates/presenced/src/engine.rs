use presence_core::{
    FaceModels, ReconcileError, ReconcileReport, Reconciler, VerificationPipeline,
    VerificationResult, VerifyRequest,
};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("reconciliation failed: {0}")]
    Reconcile(#[from] ReconcileError),
    #[error("cannot spawn worker thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("engine needs at least one worker")]
    NoWorkers,
    #[error("engine worker exited")]
    ChannelClosed,
    #[error("model worker panicked: {0}")]
    Panicked(String),
}

/// Messages sent from D-Bus handlers to a worker thread.
enum EngineRequest {
    Verify {
        request: VerifyRequest,
        reply: oneshot::Sender<VerificationResult>,
    },
    Reconcile {
        reply: oneshot::Sender<Result<ReconcileReport, EngineError>>,
    },
}

/// Clone-safe handle to the worker pool.
#[derive(Clone)]
pub struct EngineHandle {
    workers: Arc<[mpsc::Sender<EngineRequest>]>,
    next: Arc<AtomicUsize>,
}

impl EngineHandle {
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Run the verification pipeline on the next worker.
    pub async fn verify(&self, request: VerifyRequest) -> Result<VerificationResult, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pick()
            .send(EngineRequest::Verify { request, reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    /// Reconcile the gallery with the corpus on the next worker.
    ///
    /// Concurrent calls are serialised by the reconciler itself.
    pub async fn reconcile(&self) -> Result<ReconcileReport, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pick()
            .send(EngineRequest::Reconcile { reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    fn pick(&self) -> &mpsc::Sender<EngineRequest> {
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        &self.workers[i]
    }
}

/// Spawn one OS thread per model set.
///
/// Model sessions are stateful and not shared, so each worker owns its own
/// set. The pipeline and reconciler are shared; gallery reads go through the
/// store's snapshot.
pub fn spawn_engine<F>(
    models: Vec<F>,
    pipeline: Arc<VerificationPipeline>,
    reconciler: Arc<Reconciler>,
) -> Result<EngineHandle, EngineError>
where
    F: FaceModels + Send + 'static,
{
    if models.is_empty() {
        return Err(EngineError::NoWorkers);
    }

    let mut workers = Vec::with_capacity(models.len());
    for (id, mut models) in models.into_iter().enumerate() {
        let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);
        let pipeline = Arc::clone(&pipeline);
        let reconciler = Arc::clone(&reconciler);

        std::thread::Builder::new()
            .name(format!("presence-worker-{id}"))
            .spawn(move || {
                tracing::info!(worker = id, "worker thread started");
                // A panicking model fails the request, not the worker.
                while let Some(req) = rx.blocking_recv() {
                    match req {
                        EngineRequest::Verify { request, reply } => {
                            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                                pipeline.verify(&mut models, &request)
                            }))
                            .unwrap_or_else(|payload| {
                                tracing::error!(worker = id, panic = %panic_message(&*payload), "verification panicked");
                                VerificationResult::unprocessable(&request)
                            });
                            let _ = reply.send(result);
                        }
                        EngineRequest::Reconcile { reply } => {
                            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                                reconciler.reconcile(&mut models)
                            }))
                            .map_err(|payload| {
                                let message = panic_message(&*payload);
                                tracing::error!(worker = id, panic = %message, "reconciliation panicked");
                                EngineError::Panicked(message)
                            })
                            .and_then(|r| r.map_err(EngineError::from));
                            let _ = reply.send(result);
                        }
                    }
                }
                tracing::info!(worker = id, "worker thread exiting");
            })
            .map_err(EngineError::Spawn)?;

        workers.push(tx);
    }

    Ok(EngineHandle {
        workers: workers.into(),
        next: Arc::new(AtomicUsize::new(0)),
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
