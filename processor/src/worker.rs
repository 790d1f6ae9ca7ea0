use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex};
use tracing::info;

use crate::{queue::JobEnvelope, reconciler::JobReconciler};

pub const MAX_QUEUED_JOBS: usize = 128;

struct Inner {
    job_rx: mpsc::Receiver<JobEnvelope>,
}

/// Drains the job channel and hands each envelope to the reconciler. Owns
/// nothing of the reconciliation logic; it only manages the channel and the
/// shutdown signal, so the reconciler stays a pure function of its inputs.
pub struct JobWorker {
    job_tx: mpsc::Sender<JobEnvelope>,
    inner: Arc<Mutex<Inner>>,
    reconciler: Arc<JobReconciler>,
}

impl JobWorker {
    pub fn new(reconciler: Arc<JobReconciler>) -> Self {
        let (job_tx, job_rx) = mpsc::channel::<JobEnvelope>(MAX_QUEUED_JOBS);
        Self {
            job_tx,
            inner: Arc::new(Mutex::new(Inner { job_rx })),
            reconciler,
        }
    }

    pub fn get_job_tx(&self) -> mpsc::Sender<JobEnvelope> {
        self.job_tx.clone()
    }

    /// Runs until shutdown fires or every queue sender is gone. Jobs run one
    /// at a time; a stuck engine call is bounded by the client's request
    /// timeout, not by this loop.
    pub async fn start(&self, mut shutdown_rx: watch::Receiver<()>) {
        let mut inner_guard = self.inner.lock().await;
        loop {
            tokio::select! {
                envelope = inner_guard.job_rx.recv() => {
                    match envelope {
                        Some(envelope) => {
                            let mut job_shutdown = shutdown_rx.clone();
                            self.reconciler.reconcile(envelope, &mut job_shutdown).await;
                        }
                        None => {
                            info!("job channel closed, stopping worker");
                            break;
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    info!("shutdown signal received, stopping worker");
                    break;
                }
            }
        }
    }
}
