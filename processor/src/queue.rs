use anyhow::{anyhow, Result};
use async_trait::async_trait;
use data_model::{JobHandle, JobRecordRef};
use engine_api::{AuthContext, FormattedQuery};
use tokio::sync::mpsc;

/// One unit of asynchronous work handed to a worker. The record reference
/// determines the engine operation: a measure resolves through `count`, a
/// cohort through `materialize`.
#[derive(Debug, Clone)]
pub struct JobEnvelope {
    pub record: JobRecordRef,
    pub job_handle: JobHandle,
    pub query: FormattedQuery,
    pub auth: AuthContext,
}

/// Task-submission seam between the dispatcher and whatever runs the
/// reconciliation work. Injected, never a process-wide singleton, so tests
/// can capture submissions and deployments can swap the transport.
#[async_trait]
pub trait JobQueue: Send + Sync + 'static {
    /// Enqueues the job and returns the handle it was filed under. Submission
    /// must not wait for the job to run.
    async fn submit(
        &self,
        record: JobRecordRef,
        query: FormattedQuery,
        auth: AuthContext,
    ) -> Result<JobHandle>;
}

/// In-process queue backed by an mpsc channel drained by `JobWorker`.
pub struct ChannelJobQueue {
    tx: mpsc::Sender<JobEnvelope>,
}

impl ChannelJobQueue {
    pub fn new(tx: mpsc::Sender<JobEnvelope>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl JobQueue for ChannelJobQueue {
    async fn submit(
        &self,
        record: JobRecordRef,
        query: FormattedQuery,
        auth: AuthContext,
    ) -> Result<JobHandle> {
        let job_handle = JobHandle::generate();
        let envelope = JobEnvelope {
            record,
            job_handle: job_handle.clone(),
            query,
            auth,
        };
        self.tx
            .send(envelope)
            .await
            .map_err(|e| anyhow!("job queue closed: {}", e))?;
        Ok(job_handle)
    }
}
