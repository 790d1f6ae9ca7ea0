pub mod test_objects;

use std::fmt::{self, Display};

use cohort_utils::get_epoch_time_in_ms;
use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use strum::AsRefStr;

fn generate_id() -> String {
    nanoid::nanoid!(16)
}

macro_rules! id_type {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Default, Hash,
        )]
        pub struct $name(String);

        impl $name {
            pub fn new(id: String) -> Self {
                Self(id)
            }

            pub fn generate() -> Self {
                Self(generate_id())
            }

            pub fn get(&self) -> &str {
                &self.0
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

id_type!(RequestId);
id_type!(SnapshotId);
id_type!(MeasureId);
id_type!(CohortId);

/// Opaque identifier for a unit of work tracked by the queue or the compute
/// engine. The queue issues one at dispatch; the engine reports its own when
/// it answers, and the reconciler records that one on the resolved record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default, Hash)]
pub struct JobHandle(String);

impl JobHandle {
    pub fn new(id: String) -> Self {
        Self(id)
    }

    pub fn generate() -> Self {
        Self(generate_id())
    }

    pub fn get(&self) -> &str {
        &self.0
    }
}

impl Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for JobHandle {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Reference to the record a dispatched job resolves into.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum JobRecordRef {
    Measure(MeasureId),
    Cohort(CohortId),
}

impl Display for JobRecordRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobRecordRef::Measure(id) => write!(f, "measure {}", id),
            JobRecordRef::Cohort(id) => write!(f, "cohort {}", id),
        }
    }
}

/// Lifecycle of an externally computed job as tracked on local records.
///
/// `Pending -> Started -> {Finished | Failed | Killed}`. `Started` is
/// optional; a record may resolve straight out of `Pending`. Terminal states
/// admit no further transition; a new job requires a new record.
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Default,
    Hash,
    AsRefStr,
    strum::Display,
    strum::EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Started,
    Finished,
    Failed,
    Killed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Finished | JobStatus::Failed | JobStatus::Killed)
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        match (self, next) {
            (JobStatus::Pending, JobStatus::Started) => true,
            (
                JobStatus::Pending | JobStatus::Started,
                JobStatus::Finished | JobStatus::Failed | JobStatus::Killed,
            ) => true,
            _ => false,
        }
    }
}

/// Origin tag on a cohort. `UserCreated` is the only value a caller may set;
/// the others are assigned by system import and scoping paths.
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Default,
    Hash,
    AsRefStr,
    strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CohortKind {
    #[default]
    UserCreated,
    ImportedLegacy,
    OrganizationScope,
    PatientScope,
}

impl CohortKind {
    pub fn is_system_assigned(&self) -> bool {
        !matches!(self, CohortKind::UserCreated)
    }
}

/// Synchronous, caller-facing rejections. Infrastructure faults travel as
/// `anyhow::Error` instead.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("payload is not valid structured data: {0}")]
    InvalidPayload(String),
    #[error("previous snapshot {previous} does not belong to request {request}")]
    BranchMismatch {
        previous: SnapshotId,
        request: RequestId,
    },
    #[error("request {0} already has snapshots, a previous snapshot id is required")]
    NonEmptyRequest(RequestId),
    #[error("measure {measure} is not bound to snapshot {snapshot}")]
    MeasureSnapshotMismatch {
        measure: MeasureId,
        snapshot: SnapshotId,
    },
    #[error("measure {0} is referenced by at least one cohort")]
    MeasureInUse(MeasureId),
    #[error("cohort kind {0} is system-assigned and cannot be supplied by callers")]
    KindNotSettable(CohortKind),
    #[error("job status cannot move from {from} to {to}")]
    InvalidStatusTransition { from: JobStatus, to: JobStatus },
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },
}

impl DomainError {
    pub fn not_found(kind: &'static str, id: impl Display) -> Self {
        DomainError::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}

/// Named container for a line of related query edits. Owns its snapshots;
/// soft deletion cascades to them.
#[derive(Debug, Clone, Serialize, Deserialize, Builder, PartialEq, Eq)]
pub struct Request {
    pub id: RequestId,
    pub owner: String,
    pub name: String,
    #[builder(default)]
    pub description: String,
    #[builder(default)]
    pub favorite: bool,
    #[builder(default = "get_epoch_time_in_ms()")]
    pub created_at: u64,
    #[builder(default)]
    pub tombstoned_at: Option<u64>,
}

impl Request {
    pub fn is_tombstoned(&self) -> bool {
        self.tombstoned_at.is_some()
    }

    pub fn tombstone(&mut self, at: u64) {
        self.tombstoned_at.get_or_insert(at);
    }
}

/// One immutable node in a request's branching edit history. Only the two
/// bookkeeping flags change after creation.
#[derive(Debug, Clone, Serialize, Deserialize, Builder, PartialEq, Eq)]
pub struct QuerySnapshot {
    pub id: SnapshotId,
    pub request_id: RequestId,
    pub owner: String,
    #[builder(default)]
    pub previous_id: Option<SnapshotId>,
    pub payload: String,
    #[builder(default = "true")]
    pub is_active_branch: bool,
    #[builder(default)]
    pub is_saved: bool,
    #[builder(default = "get_epoch_time_in_ms()")]
    pub created_at: u64,
    #[builder(default)]
    pub tombstoned_at: Option<u64>,
}

impl QuerySnapshot {
    /// The format-validity invariant: a payload must parse as JSON before a
    /// snapshot may carry it.
    pub fn validate_payload(payload: &str) -> Result<(), DomainError> {
        serde_json::from_str::<serde_json::Value>(payload)
            .map(|_| ())
            .map_err(|e| DomainError::InvalidPayload(e.to_string()))
    }

    pub fn is_root(&self) -> bool {
        self.previous_id.is_none()
    }

    pub fn is_tombstoned(&self) -> bool {
        self.tombstoned_at.is_some()
    }
}

/// A computed-or-pending size estimate for one snapshot. Written once at
/// creation and once more when its job resolves.
#[derive(Debug, Clone, Serialize, Deserialize, Builder, PartialEq, Eq)]
pub struct DatedMeasure {
    pub id: MeasureId,
    pub snapshot_id: SnapshotId,
    pub request_id: RequestId,
    pub owner: String,
    #[builder(default)]
    pub value: Option<i64>,
    #[builder(default)]
    pub computed_at: Option<u64>,
    #[builder(default)]
    pub job_handle: Option<JobHandle>,
    #[builder(default)]
    pub job_status: JobStatus,
    #[builder(default)]
    pub failure_message: Option<String>,
    #[builder(default)]
    pub job_duration_ms: Option<u64>,
    #[builder(default = "get_epoch_time_in_ms()")]
    pub created_at: u64,
}

impl DatedMeasure {
    fn transition(&mut self, next: JobStatus) -> Result<(), DomainError> {
        if !self.job_status.can_transition_to(next) {
            return Err(DomainError::InvalidStatusTransition {
                from: self.job_status,
                to: next,
            });
        }
        self.job_status = next;
        Ok(())
    }

    pub fn mark_started(&mut self) -> Result<(), DomainError> {
        self.transition(JobStatus::Started)
    }

    /// Success write: `value` and `computed_at` land together, preserving the
    /// both-or-neither pairing.
    pub fn complete(
        &mut self,
        value: i64,
        computed_at: u64,
        engine_job_id: JobHandle,
        duration_ms: u64,
    ) -> Result<(), DomainError> {
        self.transition(JobStatus::Finished)?;
        self.value = Some(value);
        self.computed_at = Some(computed_at);
        self.job_handle = Some(engine_job_id);
        self.job_duration_ms = Some(duration_ms);
        Ok(())
    }

    pub fn fail(&mut self, message: String) -> Result<(), DomainError> {
        self.transition(JobStatus::Failed)?;
        self.failure_message = Some(message);
        Ok(())
    }

    pub fn kill(&mut self) -> Result<(), DomainError> {
        self.transition(JobStatus::Killed)
    }

    pub fn is_computed(&self) -> bool {
        self.value.is_some()
    }
}

/// A named, externally materialized cohort bound to one snapshot and the
/// measure taken at its creation. The measure binding never changes.
#[derive(Debug, Clone, Serialize, Deserialize, Builder, PartialEq, Eq)]
pub struct CohortResult {
    pub id: CohortId,
    pub snapshot_id: SnapshotId,
    pub request_id: RequestId,
    pub measure_id: MeasureId,
    pub owner: String,
    pub name: String,
    #[builder(default)]
    pub description: String,
    #[builder(default)]
    pub favorite: bool,
    #[builder(default)]
    pub group_id: Option<String>,
    #[builder(default)]
    pub job_handle: Option<JobHandle>,
    #[builder(default)]
    pub job_status: JobStatus,
    #[builder(default)]
    pub failure_message: Option<String>,
    #[builder(default)]
    pub job_duration_ms: Option<u64>,
    #[builder(default)]
    pub kind: CohortKind,
    #[builder(default = "get_epoch_time_in_ms()")]
    pub created_at: u64,
}

impl CohortResult {
    fn transition(&mut self, next: JobStatus) -> Result<(), DomainError> {
        if !self.job_status.can_transition_to(next) {
            return Err(DomainError::InvalidStatusTransition {
                from: self.job_status,
                to: next,
            });
        }
        self.job_status = next;
        Ok(())
    }

    pub fn mark_started(&mut self) -> Result<(), DomainError> {
        self.transition(JobStatus::Started)
    }

    pub fn complete(
        &mut self,
        group_id: String,
        engine_job_id: JobHandle,
        duration_ms: u64,
    ) -> Result<(), DomainError> {
        self.transition(JobStatus::Finished)?;
        self.group_id = Some(group_id);
        self.job_handle = Some(engine_job_id);
        self.job_duration_ms = Some(duration_ms);
        Ok(())
    }

    pub fn fail(&mut self, message: String) -> Result<(), DomainError> {
        self.transition(JobStatus::Failed)?;
        self.failure_message = Some(message);
        Ok(())
    }

    pub fn kill(&mut self) -> Result<(), DomainError> {
        self.transition(JobStatus::Killed)
    }
}
