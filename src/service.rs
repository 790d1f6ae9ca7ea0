use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use cohort_utils::retry::RetryPolicy;
use data_model::{
    CohortId, CohortKind, CohortResultBuilder, DatedMeasureBuilder, DomainError, JobRecordRef,
    JobStatus, MeasureId, QuerySnapshotBuilder, RequestBuilder, RequestId, SnapshotId,
};
use engine_api::{AuthContext, ComputeEngine, FormattedQuery, HttpComputeEngine};
use metrics::job_metrics;
use processor::{
    dispatcher::JobDispatcher,
    queue::ChannelJobQueue,
    reconciler::JobReconciler,
    worker::JobWorker,
};
use state_store::{
    requests::{
        CreateCohortRequest, CreateMeasureRequest, CreateRequestRequest, CreateSnapshotRequest,
        DeleteMeasureRequest, MarkSnapshotSavedRequest, RequestPayload, TombstoneRequestRequest,
        UpdateCohortMetadataRequest, UpdateRequestMetadataRequest,
    },
    scanner::StateReader,
    CohortState,
};
use tokio::sync::watch;
use tracing::info;

use crate::config::ServerConfig;

/// Composition root. The HTTP layer that fronts this service lives elsewhere;
/// these methods are the surface it calls into.
#[derive(Clone)]
pub struct Service {
    pub config: ServerConfig,
    pub shutdown_tx: watch::Sender<()>,
    pub shutdown_rx: watch::Receiver<()>,
    pub state: Arc<CohortState>,
    pub engine: Arc<dyn ComputeEngine>,
    pub dispatcher: Arc<JobDispatcher>,
    pub worker: Arc<JobWorker>,
    pub job_metrics: Arc<job_metrics::Metrics>,
}

impl Service {
    pub fn new(config: ServerConfig) -> Result<Self> {
        let engine = Arc::new(
            HttpComputeEngine::new(config.engine.clone())
                .context("error initializing compute engine client")?,
        );
        Self::with_engine(config, engine)
    }

    /// Wires the service around an injected engine client; tests hand in a
    /// stub here.
    pub fn with_engine(config: ServerConfig, engine: Arc<dyn ComputeEngine>) -> Result<Self> {
        config.validate()?;
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let state = CohortState::open(&PathBuf::from(&config.state_store_path))?;
        let job_metrics = Arc::new(job_metrics::Metrics::new());

        let reconciler = Arc::new(
            JobReconciler::new(state.clone(), engine.clone(), job_metrics.clone())
                .with_lookup_policy(RetryPolicy {
                    max_attempts: config.job_lookup.max_attempts,
                    backoff: Duration::from_millis(config.job_lookup.backoff_ms),
                }),
        );
        let worker = Arc::new(JobWorker::new(reconciler));
        let queue = Arc::new(ChannelJobQueue::new(worker.get_job_tx()));
        let dispatcher = Arc::new(JobDispatcher::new(
            state.clone(),
            engine.clone(),
            queue,
            job_metrics.clone(),
        ));

        Ok(Self {
            config,
            shutdown_tx,
            shutdown_rx,
            state,
            engine,
            dispatcher,
            worker,
            job_metrics,
        })
    }

    /// Spawns the background worker. Dispatch keeps working while the worker
    /// drains its queue on its own task.
    pub fn start(&self) -> Result<()> {
        let worker = self.worker.clone();
        let shutdown_rx = self.shutdown_rx.clone();
        tokio::spawn(async move {
            worker.start(shutdown_rx).await;
        });
        info!("cohort service started");
        Ok(())
    }

    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(());
    }

    pub fn reader(&self) -> StateReader {
        self.state.reader()
    }

    pub fn create_request(
        &self,
        owner: &str,
        name: &str,
        description: &str,
        favorite: bool,
    ) -> Result<RequestId> {
        let request = RequestBuilder::default()
            .id(RequestId::generate())
            .owner(owner.to_string())
            .name(name.to_string())
            .description(description.to_string())
            .favorite(favorite)
            .build()?;
        let request_id = request.id.clone();
        self.state
            .write(RequestPayload::CreateRequest(CreateRequestRequest {
                request,
            }))?;
        Ok(request_id)
    }

    pub fn update_request(
        &self,
        request_id: &RequestId,
        name: Option<String>,
        description: Option<String>,
        favorite: Option<bool>,
    ) -> Result<()> {
        self.state
            .write(RequestPayload::UpdateRequestMetadata(
                UpdateRequestMetadataRequest {
                    request_id: request_id.clone(),
                    name,
                    description,
                    favorite,
                },
            ))
    }

    /// Soft delete; cascades to the request's snapshots.
    pub fn delete_request(&self, request_id: &RequestId) -> Result<()> {
        self.state
            .write(RequestPayload::TombstoneRequest(TombstoneRequestRequest {
                request_id: request_id.clone(),
            }))
    }

    /// Creates a new version node. The payload is checked locally for shape
    /// and pre-flighted against the engine before anything is written; the
    /// branch bookkeeping happens inside the store transaction.
    pub async fn create_snapshot(
        &self,
        request_id: &RequestId,
        previous_id: Option<SnapshotId>,
        payload: &str,
        owner: &str,
        auth: &AuthContext,
    ) -> Result<SnapshotId> {
        data_model::QuerySnapshot::validate_payload(payload)?;
        let validated = self
            .engine
            .validate(&FormattedQuery::new(payload.to_string()), auth)
            .await?;
        if !validated.success {
            return Err(DomainError::InvalidPayload(
                validated
                    .error_message
                    .unwrap_or_else(|| "rejected by compute engine".to_string()),
            )
            .into());
        }

        let snapshot = QuerySnapshotBuilder::default()
            .id(SnapshotId::generate())
            .request_id(request_id.clone())
            .owner(owner.to_string())
            .previous_id(previous_id)
            .payload(payload.to_string())
            .build()?;
        let snapshot_id = snapshot.id.clone();
        self.state
            .write(RequestPayload::CreateSnapshot(CreateSnapshotRequest {
                snapshot,
            }))?;
        Ok(snapshot_id)
    }

    pub fn mark_saved(&self, snapshot_id: &SnapshotId) -> Result<()> {
        self.state
            .write(RequestPayload::MarkSnapshotSaved(MarkSnapshotSavedRequest {
                snapshot_id: snapshot_id.clone(),
            }))
    }

    pub async fn request_measure(
        &self,
        snapshot_id: &SnapshotId,
        auth: &AuthContext,
    ) -> Result<MeasureId> {
        self.dispatcher.request_measure(snapshot_id, auth).await
    }

    pub async fn request_cohort(
        &self,
        snapshot_id: &SnapshotId,
        name: &str,
        description: &str,
        measure_id: Option<MeasureId>,
        auth: &AuthContext,
    ) -> Result<CohortId> {
        self.dispatcher
            .request_cohort(
                snapshot_id,
                name.to_string(),
                description.to_string(),
                measure_id,
                auth,
            )
            .await
    }

    pub async fn cancel_job(&self, record: JobRecordRef, auth: &AuthContext) -> Result<JobStatus> {
        self.dispatcher.cancel_job(record, auth).await
    }

    pub fn update_cohort(
        &self,
        cohort_id: &CohortId,
        name: Option<String>,
        description: Option<String>,
        favorite: Option<bool>,
    ) -> Result<()> {
        self.state
            .write(RequestPayload::UpdateCohortMetadata(
                UpdateCohortMetadataRequest {
                    cohort_id: cohort_id.clone(),
                    name,
                    description,
                    favorite,
                },
            ))
    }

    pub fn delete_measure(&self, measure_id: &MeasureId) -> Result<()> {
        self.state
            .write(RequestPayload::DeleteMeasure(DeleteMeasureRequest {
                measure_id: measure_id.clone(),
            }))
    }

    /// Registers an externally materialized cohort, e.g. one carried over
    /// from a legacy system. No job is dispatched; the records land already
    /// finished, under a system-assigned kind.
    pub fn import_cohort(
        &self,
        snapshot_id: &SnapshotId,
        name: &str,
        description: &str,
        kind: CohortKind,
        group_id: &str,
        size: i64,
        computed_at: u64,
    ) -> Result<CohortId> {
        let snapshot = self
            .reader()
            .get_snapshot(snapshot_id)?
            .filter(|snapshot| !snapshot.is_tombstoned())
            .ok_or_else(|| DomainError::not_found("snapshot", snapshot_id))?;

        let measure = DatedMeasureBuilder::default()
            .id(MeasureId::generate())
            .snapshot_id(snapshot.id.clone())
            .request_id(snapshot.request_id.clone())
            .owner(snapshot.owner.clone())
            .value(Some(size))
            .computed_at(Some(computed_at))
            .job_status(JobStatus::Finished)
            .build()?;
        let measure_id = measure.id.clone();
        self.state
            .write(RequestPayload::CreateMeasure(CreateMeasureRequest {
                measure,
            }))?;

        let cohort = CohortResultBuilder::default()
            .id(CohortId::generate())
            .snapshot_id(snapshot.id.clone())
            .request_id(snapshot.request_id.clone())
            .measure_id(measure_id)
            .owner(snapshot.owner.clone())
            .name(name.to_string())
            .description(description.to_string())
            .group_id(Some(group_id.to_string()))
            .job_status(JobStatus::Finished)
            .kind(kind)
            .build()?;
        let cohort_id = cohort.id.clone();
        self.state
            .write(RequestPayload::CreateCohort(CreateCohortRequest {
                cohort,
                allow_system_kind: true,
            }))?;
        Ok(cohort_id)
    }
}
