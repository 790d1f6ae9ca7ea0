use std::{fs, path::Path, sync::Arc};

use anyhow::{anyhow, Result};
use metrics::{state_metrics::StateStoreMetrics, Timer};
use requests::RequestPayload;
use rocksdb::{ColumnFamilyDescriptor, Options, TransactionDB, TransactionDBOptions};
use state_machine::CohortObjectsColumns;
use strum::IntoEnumIterator;
use tracing::{debug, error, info};

pub mod requests;
pub mod scanner;
pub mod serializer;
pub mod state_machine;
pub mod test_state_store;

/// Durable store for requests, snapshots, measures and cohorts. Every
/// mutation runs as one pessimistic RocksDB transaction, which is what the
/// version-graph invariants lean on under concurrent writers.
pub struct CohortState {
    pub db: Arc<TransactionDB>,
    pub metrics: Arc<StateStoreMetrics>,
}

impl CohortState {
    pub fn open(path: &Path) -> Result<Arc<Self>> {
        fs::create_dir_all(path)
            .map_err(|e| anyhow!("failed to create state store dir: {}", e))?;
        let sm_column_families = CohortObjectsColumns::iter()
            .map(|cf| ColumnFamilyDescriptor::new(cf.to_string(), Options::default()));
        let mut db_opts = Options::default();
        db_opts.create_missing_column_families(true);
        db_opts.create_if_missing(true);
        let db = Arc::new(
            TransactionDB::open_cf_descriptors(
                &db_opts,
                &TransactionDBOptions::default(),
                path,
                sm_column_families,
            )
            .map_err(|e| anyhow!("failed to open db: {}", e))?,
        );
        info!("initialized cohort state store at {}", path.display());
        Ok(Arc::new(Self {
            db,
            metrics: Arc::new(StateStoreMetrics::new()),
        }))
    }

    #[tracing::instrument(
        skip(self, payload),
        fields(request_type = payload.to_string())
    )]
    pub fn write(&self, payload: RequestPayload) -> Result<()> {
        debug!("writing state update");
        let _timer = Timer::start(&self.metrics.write_latency);
        self.metrics.state_writes.add(1);
        let txn = self.db.transaction();
        let result = match &payload {
            RequestPayload::CreateRequest(req) => {
                state_machine::create_request(self.db.clone(), &txn, req)
            }
            RequestPayload::UpdateRequestMetadata(req) => {
                state_machine::update_request_metadata(self.db.clone(), &txn, req)
            }
            RequestPayload::TombstoneRequest(req) => {
                state_machine::tombstone_request(self.db.clone(), &txn, req)
            }
            RequestPayload::CreateSnapshot(req) => {
                state_machine::create_snapshot(self.db.clone(), &txn, req)
            }
            RequestPayload::MarkSnapshotSaved(req) => {
                state_machine::mark_snapshot_saved(self.db.clone(), &txn, req)
            }
            RequestPayload::CreateMeasure(req) => {
                state_machine::create_measure(self.db.clone(), &txn, req)
            }
            RequestPayload::DeleteMeasure(req) => {
                state_machine::delete_measure(self.db.clone(), &txn, req)
            }
            RequestPayload::CreateCohort(req) => {
                state_machine::create_cohort(self.db.clone(), &txn, req)
            }
            RequestPayload::UpdateCohortMetadata(req) => {
                state_machine::update_cohort_metadata(self.db.clone(), &txn, req)
            }
            RequestPayload::DeleteCohort(req) => {
                state_machine::delete_cohort(self.db.clone(), &txn, req)
            }
            RequestPayload::SetJobHandle(req) => {
                state_machine::set_job_handle(self.db.clone(), &txn, req)
            }
            RequestPayload::MarkJobStarted(req) => {
                state_machine::mark_job_started(self.db.clone(), &txn, req)
            }
            RequestPayload::FinalizeMeasureJob(req) => {
                state_machine::finalize_measure_job(self.db.clone(), &txn, req)
            }
            RequestPayload::FinalizeCohortJob(req) => {
                state_machine::finalize_cohort_job(self.db.clone(), &txn, req)
            }
            RequestPayload::KillJob(req) => state_machine::kill_job(self.db.clone(), &txn, req),
        };
        if let Err(err) = result {
            self.metrics.write_errors.add(1);
            error!("error applying state update: {:?}", err);
            return Err(err);
        }
        txn.commit()?;
        Ok(())
    }

    pub fn reader(&self) -> scanner::StateReader {
        scanner::StateReader::new(self.db.clone())
    }
}

#[cfg(test)]
mod tests {
    use data_model::{
        test_objects::tests::{mock_branch_snapshot, mock_cohort, mock_measure, TEST_OWNER},
        CohortKind, CohortResultBuilder, DomainError, JobHandle, JobRecordRef, JobStatus,
        MeasureId, SnapshotId,
    };
    use requests::{
        CohortJobOutcome, CohortJobSuccess, CreateCohortRequest, CreateMeasureRequest,
        CreateSnapshotRequest, DeleteCohortRequest, DeleteMeasureRequest,
        FinalizeCohortJobRequest, FinalizeMeasureJobRequest, JobFailure, KillJobRequest,
        MarkSnapshotSavedRequest, MeasureJobOutcome, MeasureJobSuccess, TombstoneRequestRequest,
        UpdateCohortMetadataRequest,
    };
    use test_state_store::TestStateStore;

    use super::*;

    #[tokio::test]
    async fn test_single_root_per_request() -> Result<()> {
        let store = TestStateStore::new()?;
        let request_id = store.with_request("req_a");
        store.with_root_snapshot(&request_id, "s1")?;

        let err = store
            .state
            .write(RequestPayload::CreateSnapshot(CreateSnapshotRequest {
                snapshot: data_model::test_objects::tests::mock_root_snapshot(
                    "s2",
                    request_id.get(),
                ),
            }))
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<DomainError>(),
            Some(&DomainError::NonEmptyRequest(request_id.clone()))
        );

        // The failed write left no row behind.
        let snapshots = store.state.reader().snapshots_of_request(&request_id)?;
        assert_eq!(snapshots.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_branch_exclusivity_among_siblings() -> Result<()> {
        let store = TestStateStore::new()?;
        let request_id = store.with_request("req_a");
        let s1 = store.with_root_snapshot(&request_id, "s1")?;
        let s2 = store.with_branch(&request_id, &s1, "s2", r#"{"age": 40}"#)?;

        let reader = store.state.reader();
        assert!(reader.get_snapshot(&s2)?.unwrap().is_active_branch);

        let s3 = store.with_branch(&request_id, &s1, "s3", r#"{"age": 50}"#)?;
        assert!(reader.get_snapshot(&s3)?.unwrap().is_active_branch);
        assert!(!reader.get_snapshot(&s2)?.unwrap().is_active_branch);
        // The parent is untouched; exclusivity is a sibling property.
        assert!(reader.get_snapshot(&s1)?.unwrap().is_active_branch);

        let active: Vec<_> = reader
            .children_of(&s1)?
            .into_iter()
            .filter(|snapshot| snapshot.is_active_branch)
            .collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, s3);
        Ok(())
    }

    #[tokio::test]
    async fn test_branch_mismatch_rejected() -> Result<()> {
        let store = TestStateStore::new()?;
        let req_a = store.with_request("req_a");
        let req_b = store.with_request("req_b");
        let s1 = store.with_root_snapshot(&req_a, "s1")?;

        let err = store
            .state
            .write(RequestPayload::CreateSnapshot(CreateSnapshotRequest {
                snapshot: mock_branch_snapshot("s2", req_b.get(), s1.get(), "{}"),
            }))
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<DomainError>(),
            Some(&DomainError::BranchMismatch {
                previous: s1,
                request: req_b,
            })
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_invalid_payload_rejected() -> Result<()> {
        let store = TestStateStore::new()?;
        let request_id = store.with_request("req_a");
        let mut snapshot =
            data_model::test_objects::tests::mock_root_snapshot("s1", request_id.get());
        snapshot.payload = "age > 40".to_string();

        let err = store
            .state
            .write(RequestPayload::CreateSnapshot(CreateSnapshotRequest {
                snapshot,
            }))
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DomainError>(),
            Some(DomainError::InvalidPayload(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_single_saved_snapshot_per_request() -> Result<()> {
        let store = TestStateStore::new()?;
        let request_id = store.with_request("req_a");
        let s1 = store.with_root_snapshot(&request_id, "s1")?;
        let s2 = store.with_branch(&request_id, &s1, "s2", "{}")?;

        store
            .state
            .write(RequestPayload::MarkSnapshotSaved(MarkSnapshotSavedRequest {
                snapshot_id: s1.clone(),
            }))?;
        let reader = store.state.reader();
        assert!(reader.get_snapshot(&s1)?.unwrap().is_saved);
        assert_eq!(reader.saved_snapshot_of(&request_id)?.unwrap().id, s1);

        store
            .state
            .write(RequestPayload::MarkSnapshotSaved(MarkSnapshotSavedRequest {
                snapshot_id: s2.clone(),
            }))?;
        assert!(!reader.get_snapshot(&s1)?.unwrap().is_saved);
        assert!(reader.get_snapshot(&s2)?.unwrap().is_saved);

        let saved: Vec<_> = reader
            .snapshots_of_request(&request_id)?
            .into_iter()
            .filter(|snapshot| snapshot.is_saved)
            .collect();
        assert_eq!(saved.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_tombstone_request_cascades_to_snapshots() -> Result<()> {
        let store = TestStateStore::new()?;
        let request_id = store.with_request("req_a");
        let s1 = store.with_root_snapshot(&request_id, "s1")?;
        let s2 = store.with_branch(&request_id, &s1, "s2", "{}")?;

        store
            .state
            .write(RequestPayload::TombstoneRequest(TombstoneRequestRequest {
                request_id: request_id.clone(),
            }))?;

        let reader = store.state.reader();
        assert!(reader.get_request(&request_id)?.unwrap().is_tombstoned());
        assert!(reader.get_snapshot(&s1)?.unwrap().is_tombstoned());
        assert!(reader.get_snapshot(&s2)?.unwrap().is_tombstoned());

        // A tombstoned request refuses further snapshots.
        let err = store
            .state
            .write(RequestPayload::CreateSnapshot(CreateSnapshotRequest {
                snapshot: mock_branch_snapshot("s3", request_id.get(), s1.get(), "{}"),
            }))
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DomainError>(),
            Some(DomainError::NotFound { .. })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_measure_delete_blocked_while_referenced() -> Result<()> {
        let store = TestStateStore::new()?;
        let request_id = store.with_request("req_a");
        let s1 = store.with_root_snapshot(&request_id, "s1")?;
        let measure_id = store.with_measure(&request_id, &s1)?;
        let cohort_id = store.with_cohort(&request_id, &s1, &measure_id)?;

        let err = store
            .state
            .write(RequestPayload::DeleteMeasure(DeleteMeasureRequest {
                measure_id: measure_id.clone(),
            }))
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<DomainError>(),
            Some(&DomainError::MeasureInUse(measure_id.clone()))
        );

        store
            .state
            .write(RequestPayload::DeleteCohort(DeleteCohortRequest {
                cohort_id,
            }))?;
        store
            .state
            .write(RequestPayload::DeleteMeasure(DeleteMeasureRequest {
                measure_id: measure_id.clone(),
            }))?;
        assert!(store.state.reader().get_measure(&measure_id)?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_cohort_rejects_measure_from_other_snapshot() -> Result<()> {
        let store = TestStateStore::new()?;
        let request_id = store.with_request("req_a");
        let s1 = store.with_root_snapshot(&request_id, "s1")?;
        let s2 = store.with_branch(&request_id, &s1, "s2", "{}")?;
        let foreign_measure = store.with_measure(&request_id, &s2)?;

        let cohort = mock_cohort(s1.get(), request_id.get(), foreign_measure.get());
        let cohort_id = cohort.id.clone();
        let err = store
            .state
            .write(RequestPayload::CreateCohort(CreateCohortRequest {
                cohort,
                allow_system_kind: false,
            }))
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<DomainError>(),
            Some(&DomainError::MeasureSnapshotMismatch {
                measure: foreign_measure,
                snapshot: s1,
            })
        );
        // No cohort row was created by the failed write.
        assert!(store.state.reader().get_cohort(&cohort_id)?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_cohort_system_kind_not_settable() -> Result<()> {
        let store = TestStateStore::new()?;
        let request_id = store.with_request("req_a");
        let s1 = store.with_root_snapshot(&request_id, "s1")?;
        let measure_id = store.with_measure(&request_id, &s1)?;

        let cohort = CohortResultBuilder::default()
            .id(data_model::CohortId::from("c1"))
            .snapshot_id(s1.clone())
            .request_id(request_id.clone())
            .measure_id(measure_id.clone())
            .owner(TEST_OWNER.to_string())
            .name("imported".to_string())
            .kind(CohortKind::ImportedLegacy)
            .build()
            .unwrap();
        let err = store
            .state
            .write(RequestPayload::CreateCohort(CreateCohortRequest {
                cohort: cohort.clone(),
                allow_system_kind: false,
            }))
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<DomainError>(),
            Some(&DomainError::KindNotSettable(CohortKind::ImportedLegacy))
        );

        // The system import path is allowed to assign it.
        store
            .state
            .write(RequestPayload::CreateCohort(CreateCohortRequest {
                cohort,
                allow_system_kind: true,
            }))?;
        Ok(())
    }

    #[tokio::test]
    async fn test_finalize_measure_success_pairs_value_and_datetime() -> Result<()> {
        let store = TestStateStore::new()?;
        let request_id = store.with_request("req_a");
        let s1 = store.with_root_snapshot(&request_id, "s1")?;
        let measure_id = store.with_measure(&request_id, &s1)?;

        store
            .state
            .write(RequestPayload::FinalizeMeasureJob(FinalizeMeasureJobRequest {
                measure_id: measure_id.clone(),
                outcome: MeasureJobOutcome::Success(MeasureJobSuccess {
                    value: 120,
                    computed_at: 1_700_000_000_000,
                    engine_job_id: JobHandle::from("engine-1"),
                    duration_ms: 900,
                }),
            }))?;

        let measure = store.state.reader().get_measure(&measure_id)?.unwrap();
        assert_eq!(measure.value, Some(120));
        assert_eq!(measure.computed_at, Some(1_700_000_000_000));
        assert_eq!(measure.job_status, JobStatus::Finished);
        assert_eq!(measure.job_handle, Some(JobHandle::from("engine-1")));
        Ok(())
    }

    #[tokio::test]
    async fn test_finalize_cohort_failure_lands_on_both_rows() -> Result<()> {
        let store = TestStateStore::new()?;
        let request_id = store.with_request("req_a");
        let s1 = store.with_root_snapshot(&request_id, "s1")?;
        let measure_id = store.with_measure(&request_id, &s1)?;
        let cohort_id = store.with_cohort(&request_id, &s1, &measure_id)?;

        store
            .state
            .write(RequestPayload::FinalizeCohortJob(FinalizeCohortJobRequest {
                cohort_id: cohort_id.clone(),
                outcome: CohortJobOutcome::Failure(JobFailure {
                    message: "engine timed out".to_string(),
                    engine_job_id: None,
                    duration_ms: None,
                }),
            }))?;

        let reader = store.state.reader();
        let cohort = reader.get_cohort(&cohort_id)?.unwrap();
        let measure = reader.get_measure(&measure_id)?.unwrap();
        assert_eq!(cohort.job_status, JobStatus::Failed);
        assert_eq!(measure.job_status, JobStatus::Failed);
        assert_eq!(cohort.failure_message.as_deref(), Some("engine timed out"));
        assert_eq!(measure.failure_message.as_deref(), Some("engine timed out"));
        Ok(())
    }

    #[tokio::test]
    async fn test_finalize_cohort_success_writes_through_measure() -> Result<()> {
        let store = TestStateStore::new()?;
        let request_id = store.with_request("req_a");
        let s1 = store.with_root_snapshot(&request_id, "s1")?;
        let measure_id = store.with_measure(&request_id, &s1)?;
        let cohort_id = store.with_cohort(&request_id, &s1, &measure_id)?;

        store
            .state
            .write(RequestPayload::FinalizeCohortJob(FinalizeCohortJobRequest {
                cohort_id: cohort_id.clone(),
                outcome: CohortJobOutcome::Success(CohortJobSuccess {
                    group_id: "grp-9".to_string(),
                    value: 87,
                    computed_at: 1_700_000_000_000,
                    engine_job_id: JobHandle::from("engine-2"),
                    duration_ms: 4_000,
                }),
            }))?;

        let reader = store.state.reader();
        let cohort = reader.get_cohort(&cohort_id)?.unwrap();
        let measure = reader.get_measure(&measure_id)?.unwrap();
        assert_eq!(cohort.group_id.as_deref(), Some("grp-9"));
        assert_eq!(cohort.job_status, JobStatus::Finished);
        assert_eq!(measure.value, Some(87));
        assert_eq!(measure.job_status, JobStatus::Finished);
        Ok(())
    }

    #[tokio::test]
    async fn test_reused_terminal_measure_keeps_its_outcome() -> Result<()> {
        let store = TestStateStore::new()?;
        let request_id = store.with_request("req_a");
        let s1 = store.with_root_snapshot(&request_id, "s1")?;
        let measure_id = store.with_measure(&request_id, &s1)?;

        // Resolve the measure's own sizing job first.
        store
            .state
            .write(RequestPayload::FinalizeMeasureJob(FinalizeMeasureJobRequest {
                measure_id: measure_id.clone(),
                outcome: MeasureJobOutcome::Success(MeasureJobSuccess {
                    value: 120,
                    computed_at: 1_700_000_000_000,
                    engine_job_id: JobHandle::from("engine-1"),
                    duration_ms: 900,
                }),
            }))?;

        let cohort_id = store.with_cohort(&request_id, &s1, &measure_id)?;
        store
            .state
            .write(RequestPayload::FinalizeCohortJob(FinalizeCohortJobRequest {
                cohort_id: cohort_id.clone(),
                outcome: CohortJobOutcome::Failure(JobFailure {
                    message: "materialization refused".to_string(),
                    engine_job_id: None,
                    duration_ms: None,
                }),
            }))?;

        let reader = store.state.reader();
        assert_eq!(
            reader.get_cohort(&cohort_id)?.unwrap().job_status,
            JobStatus::Failed
        );
        // The reused measure's finished estimate survives.
        let measure = reader.get_measure(&measure_id)?.unwrap();
        assert_eq!(measure.job_status, JobStatus::Finished);
        assert_eq!(measure.value, Some(120));
        Ok(())
    }

    #[tokio::test]
    async fn test_cohort_update_touches_metadata_only() -> Result<()> {
        let store = TestStateStore::new()?;
        let request_id = store.with_request("req_a");
        let s1 = store.with_root_snapshot(&request_id, "s1")?;
        let measure_id = store.with_measure(&request_id, &s1)?;
        let cohort_id = store.with_cohort(&request_id, &s1, &measure_id)?;

        store
            .state
            .write(RequestPayload::UpdateCohortMetadata(
                UpdateCohortMetadataRequest {
                    cohort_id: cohort_id.clone(),
                    name: Some("renamed".to_string()),
                    description: None,
                    favorite: Some(true),
                },
            ))?;

        let cohort = store.state.reader().get_cohort(&cohort_id)?.unwrap();
        assert_eq!(cohort.name, "renamed");
        assert!(cohort.favorite);
        // The measure binding and job fields are beyond reach of any update.
        assert_eq!(cohort.measure_id, measure_id);
        assert_eq!(cohort.snapshot_id, s1);
        assert_eq!(cohort.job_status, JobStatus::Pending);
        Ok(())
    }

    #[tokio::test]
    async fn test_kill_job_noop_on_terminal_record() -> Result<()> {
        let store = TestStateStore::new()?;
        let request_id = store.with_request("req_a");
        let s1 = store.with_root_snapshot(&request_id, "s1")?;
        let measure_id = store.with_measure(&request_id, &s1)?;

        store
            .state
            .write(RequestPayload::KillJob(KillJobRequest {
                record: JobRecordRef::Measure(measure_id.clone()),
            }))?;
        let reader = store.state.reader();
        assert_eq!(
            reader.get_measure(&measure_id)?.unwrap().job_status,
            JobStatus::Killed
        );

        // Killing again, or killing a finished record, changes nothing.
        store
            .state
            .write(RequestPayload::KillJob(KillJobRequest {
                record: JobRecordRef::Measure(measure_id.clone()),
            }))?;
        assert_eq!(
            reader.get_measure(&measure_id)?.unwrap().job_status,
            JobStatus::Killed
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_records_surface_not_found() -> Result<()> {
        let store = TestStateStore::new()?;
        let err = store
            .state
            .write(RequestPayload::MarkSnapshotSaved(MarkSnapshotSavedRequest {
                snapshot_id: SnapshotId::from("ghost"),
            }))
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DomainError>(),
            Some(DomainError::NotFound { .. })
        ));

        let err = store
            .state
            .write(RequestPayload::DeleteMeasure(DeleteMeasureRequest {
                measure_id: MeasureId::from("ghost"),
            }))
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DomainError>(),
            Some(DomainError::NotFound { .. })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_create_measure_requires_live_snapshot() -> Result<()> {
        let store = TestStateStore::new()?;
        let request_id = store.with_request("req_a");
        let err = store
            .state
            .write(RequestPayload::CreateMeasure(CreateMeasureRequest {
                measure: mock_measure("ghost", request_id.get()),
            }))
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DomainError>(),
            Some(DomainError::NotFound { .. })
        ));
        Ok(())
    }
}
