use data_model::{
    CohortId, CohortResult, DatedMeasure, JobHandle, JobRecordRef, MeasureId, QuerySnapshot,
    Request, RequestId, SnapshotId,
};

/// Every mutation of the store goes through exactly one of these payloads;
/// each is applied inside a single RocksDB transaction.
#[derive(Debug, Clone, strum::Display)]
pub enum RequestPayload {
    CreateRequest(CreateRequestRequest),
    UpdateRequestMetadata(UpdateRequestMetadataRequest),
    TombstoneRequest(TombstoneRequestRequest),
    CreateSnapshot(CreateSnapshotRequest),
    MarkSnapshotSaved(MarkSnapshotSavedRequest),
    CreateMeasure(CreateMeasureRequest),
    DeleteMeasure(DeleteMeasureRequest),
    CreateCohort(CreateCohortRequest),
    UpdateCohortMetadata(UpdateCohortMetadataRequest),
    DeleteCohort(DeleteCohortRequest),
    SetJobHandle(SetJobHandleRequest),
    MarkJobStarted(MarkJobStartedRequest),
    FinalizeMeasureJob(FinalizeMeasureJobRequest),
    FinalizeCohortJob(FinalizeCohortJobRequest),
    KillJob(KillJobRequest),
}

#[derive(Debug, Clone)]
pub struct CreateRequestRequest {
    pub request: Request,
}

#[derive(Debug, Clone)]
pub struct UpdateRequestMetadataRequest {
    pub request_id: RequestId,
    pub name: Option<String>,
    pub description: Option<String>,
    pub favorite: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct TombstoneRequestRequest {
    pub request_id: RequestId,
}

#[derive(Debug, Clone)]
pub struct CreateSnapshotRequest {
    pub snapshot: QuerySnapshot,
}

#[derive(Debug, Clone)]
pub struct MarkSnapshotSavedRequest {
    pub snapshot_id: SnapshotId,
}

#[derive(Debug, Clone)]
pub struct CreateMeasureRequest {
    pub measure: DatedMeasure,
}

#[derive(Debug, Clone)]
pub struct DeleteMeasureRequest {
    pub measure_id: MeasureId,
}

#[derive(Debug, Clone)]
pub struct CreateCohortRequest {
    pub cohort: CohortResult,
    /// System import paths set this; user-facing creation leaves it false so
    /// a caller-supplied system kind is rejected.
    pub allow_system_kind: bool,
}

/// Metadata only. The snapshot and measure bindings, the kind and the job
/// fields have no update path at all.
#[derive(Debug, Clone)]
pub struct UpdateCohortMetadataRequest {
    pub cohort_id: CohortId,
    pub name: Option<String>,
    pub description: Option<String>,
    pub favorite: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct DeleteCohortRequest {
    pub cohort_id: CohortId,
}

#[derive(Debug, Clone)]
pub struct SetJobHandleRequest {
    pub record: JobRecordRef,
    pub job_handle: JobHandle,
}

#[derive(Debug, Clone)]
pub struct MarkJobStartedRequest {
    pub record: JobRecordRef,
}

#[derive(Debug, Clone)]
pub struct MeasureJobSuccess {
    pub value: i64,
    pub computed_at: u64,
    pub engine_job_id: JobHandle,
    pub duration_ms: u64,
}

#[derive(Debug, Clone)]
pub struct CohortJobSuccess {
    pub group_id: String,
    pub value: i64,
    pub computed_at: u64,
    pub engine_job_id: JobHandle,
    pub duration_ms: u64,
}

#[derive(Debug, Clone)]
pub struct JobFailure {
    pub message: String,
    pub engine_job_id: Option<JobHandle>,
    pub duration_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub enum MeasureJobOutcome {
    Success(MeasureJobSuccess),
    Failure(JobFailure),
}

#[derive(Debug, Clone)]
pub enum CohortJobOutcome {
    Success(CohortJobSuccess),
    Failure(JobFailure),
}

#[derive(Debug, Clone)]
pub struct FinalizeMeasureJobRequest {
    pub measure_id: MeasureId,
    pub outcome: MeasureJobOutcome,
}

#[derive(Debug, Clone)]
pub struct FinalizeCohortJobRequest {
    pub cohort_id: CohortId,
    pub outcome: CohortJobOutcome,
}

#[derive(Debug, Clone)]
pub struct KillJobRequest {
    pub record: JobRecordRef,
}
