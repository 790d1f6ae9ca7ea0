use std::sync::Arc;

use anyhow::Result;
use data_model::{
    CohortId, CohortResultBuilder, DatedMeasureBuilder, DomainError, JobRecordRef, JobStatus,
    MeasureId, QuerySnapshot, SnapshotId,
};
use engine_api::{AuthContext, ComputeEngine, EngineJobStatus, FormattedQuery};
use metrics::job_metrics;
use state_store::{
    requests::{
        CreateCohortRequest, CreateMeasureRequest, DeleteCohortRequest, DeleteMeasureRequest,
        KillJobRequest, RequestPayload, SetJobHandleRequest,
    },
    CohortState,
};
use tracing::{error, info};

use crate::queue::JobQueue;

/// Submits compute jobs and records their handles. Fire-and-forget from the
/// caller's perspective: both entry points return the new record's id as soon
/// as the job is queued, and the reconciler delivers the outcome later.
pub struct JobDispatcher {
    state: Arc<CohortState>,
    engine: Arc<dyn ComputeEngine>,
    queue: Arc<dyn JobQueue>,
    metrics: Arc<job_metrics::Metrics>,
}

impl JobDispatcher {
    pub fn new(
        state: Arc<CohortState>,
        engine: Arc<dyn ComputeEngine>,
        queue: Arc<dyn JobQueue>,
        metrics: Arc<job_metrics::Metrics>,
    ) -> Self {
        Self {
            state,
            engine,
            queue,
            metrics,
        }
    }

    fn live_snapshot(&self, snapshot_id: &SnapshotId) -> Result<QuerySnapshot> {
        let snapshot = self
            .state
            .reader()
            .get_snapshot(snapshot_id)?
            .filter(|snapshot| !snapshot.is_tombstoned())
            .ok_or_else(|| DomainError::not_found("snapshot", snapshot_id))?;
        Ok(snapshot)
    }

    fn create_empty_measure(&self, snapshot: &QuerySnapshot) -> Result<MeasureId> {
        let measure = DatedMeasureBuilder::default()
            .id(MeasureId::generate())
            .snapshot_id(snapshot.id.clone())
            .request_id(snapshot.request_id.clone())
            .owner(snapshot.owner.clone())
            .build()?;
        let measure_id = measure.id.clone();
        self.state
            .write(RequestPayload::CreateMeasure(CreateMeasureRequest {
                measure,
            }))?;
        Ok(measure_id)
    }

    fn delete_measure_best_effort(&self, measure_id: &MeasureId) {
        if let Err(err) = self
            .state
            .write(RequestPayload::DeleteMeasure(DeleteMeasureRequest {
                measure_id: measure_id.clone(),
            }))
        {
            error!(
                measure_id = measure_id.get(),
                "failed to clean up measure after dispatch error: {:?}", err
            );
        }
    }

    /// Creates an empty measure for the snapshot and queues its sizing job.
    /// Returns the measure id immediately; the value arrives through the
    /// reconciler.
    pub async fn request_measure(
        &self,
        snapshot_id: &SnapshotId,
        auth: &AuthContext,
    ) -> Result<MeasureId> {
        let snapshot = self.live_snapshot(snapshot_id)?;
        let measure_id = self.create_empty_measure(&snapshot)?;

        // Query translation is the embedder's boundary; the payload goes to
        // the engine as stored.
        let submitted = self
            .queue
            .submit(
                JobRecordRef::Measure(measure_id.clone()),
                FormattedQuery::new(snapshot.payload.clone()),
                auth.clone(),
            )
            .await;
        let job_handle = match submitted {
            Ok(job_handle) => job_handle,
            Err(err) => {
                // The row exists but no worker will ever resolve it; take it
                // back out and surface the dispatch error.
                self.delete_measure_best_effort(&measure_id);
                return Err(err);
            }
        };
        self.state
            .write(RequestPayload::SetJobHandle(SetJobHandleRequest {
                record: JobRecordRef::Measure(measure_id.clone()),
                job_handle,
            }))?;
        self.metrics.jobs_dispatched.add(1);
        info!(
            measure_id = measure_id.get(),
            snapshot_id = snapshot_id.get(),
            "measure job dispatched"
        );
        Ok(measure_id)
    }

    /// Creates a cohort bound to the snapshot and queues its materialization
    /// job. A supplied `measure_id` must belong to the same snapshot and is
    /// reused as-is; otherwise an empty measure is created alongside, and the
    /// engine's combined response fills both rows.
    pub async fn request_cohort(
        &self,
        snapshot_id: &SnapshotId,
        name: String,
        description: String,
        measure_id: Option<MeasureId>,
        auth: &AuthContext,
    ) -> Result<CohortId> {
        let snapshot = self.live_snapshot(snapshot_id)?;
        let (measure_id, measure_created) = match measure_id {
            Some(measure_id) => (measure_id, false),
            None => (self.create_empty_measure(&snapshot)?, true),
        };

        let cohort = CohortResultBuilder::default()
            .id(CohortId::generate())
            .snapshot_id(snapshot.id.clone())
            .request_id(snapshot.request_id.clone())
            .measure_id(measure_id.clone())
            .owner(snapshot.owner.clone())
            .name(name)
            .description(description)
            .build()?;
        let cohort_id = cohort.id.clone();
        let created = self
            .state
            .write(RequestPayload::CreateCohort(CreateCohortRequest {
                cohort,
                allow_system_kind: false,
            }));
        if let Err(err) = created {
            if measure_created {
                self.delete_measure_best_effort(&measure_id);
            }
            return Err(err);
        }

        let submitted = self
            .queue
            .submit(
                JobRecordRef::Cohort(cohort_id.clone()),
                FormattedQuery::new(snapshot.payload.clone()),
                auth.clone(),
            )
            .await;
        let job_handle = match submitted {
            Ok(job_handle) => job_handle,
            Err(err) => {
                if let Err(err) = self
                    .state
                    .write(RequestPayload::DeleteCohort(DeleteCohortRequest {
                        cohort_id: cohort_id.clone(),
                    }))
                {
                    error!(
                        cohort_id = cohort_id.get(),
                        "failed to clean up cohort after dispatch error: {:?}", err
                    );
                }
                if measure_created {
                    self.delete_measure_best_effort(&measure_id);
                }
                return Err(err);
            }
        };
        self.state
            .write(RequestPayload::SetJobHandle(SetJobHandleRequest {
                record: JobRecordRef::Cohort(cohort_id.clone()),
                job_handle,
            }))?;
        self.metrics.jobs_dispatched.add(1);
        info!(
            cohort_id = cohort_id.get(),
            snapshot_id = snapshot_id.get(),
            "cohort materialization job dispatched"
        );
        Ok(cohort_id)
    }

    /// Best-effort cancellation. The local transition to `Killed` happens
    /// only after the engine confirms, or when the job never reached a queue.
    /// Cancelling a terminal record is a no-op, not an error.
    pub async fn cancel_job(&self, record: JobRecordRef, auth: &AuthContext) -> Result<JobStatus> {
        let reader = self.state.reader();
        let (job_status, job_handle) = match &record {
            JobRecordRef::Measure(measure_id) => {
                let measure = reader
                    .get_measure(measure_id)?
                    .ok_or_else(|| DomainError::not_found("measure", measure_id))?;
                (measure.job_status, measure.job_handle)
            }
            JobRecordRef::Cohort(cohort_id) => {
                let cohort = reader
                    .get_cohort(cohort_id)?
                    .ok_or_else(|| DomainError::not_found("cohort", cohort_id))?;
                (cohort.job_status, cohort.job_handle)
            }
        };
        if job_status.is_terminal() {
            return Ok(job_status);
        }

        let Some(job_handle) = job_handle else {
            // Never dispatched; nothing for the engine to abort.
            self.state
                .write(RequestPayload::KillJob(KillJobRequest {
                    record: record.clone(),
                }))?;
            return Ok(JobStatus::Killed);
        };

        let engine_status = self.engine.cancel(job_handle.get(), auth).await?;
        match engine_status {
            EngineJobStatus::Killed | EngineJobStatus::Pending => {
                self.state
                    .write(RequestPayload::KillJob(KillJobRequest {
                        record: record.clone(),
                    }))?;
                info!(record = record.to_string(), "job cancelled");
                Ok(JobStatus::Killed)
            }
            _ => {
                // Engine would not or could not abort; leave the record for
                // the reconciler to resolve.
                info!(
                    record = record.to_string(),
                    engine_status = engine_status.to_string(),
                    "engine did not confirm cancellation"
                );
                Ok(job_status)
            }
        }
    }
}
