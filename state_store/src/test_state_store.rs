use std::sync::Arc;

use anyhow::Result;
use data_model::{
    test_objects::tests::{
        mock_branch_snapshot, mock_cohort, mock_measure, mock_request, mock_root_snapshot,
    },
    CohortId, MeasureId, RequestId, SnapshotId,
};
use tempfile::TempDir;

use crate::{
    requests::{
        CreateCohortRequest, CreateMeasureRequest, CreateRequestRequest, CreateSnapshotRequest,
        RequestPayload,
    },
    CohortState,
};

/// A store over a throwaway directory plus shorthand for seeding the graph
/// fixtures most tests start from.
pub struct TestStateStore {
    pub state: Arc<CohortState>,
    _temp_dir: TempDir,
}

impl TestStateStore {
    pub fn new() -> Result<TestStateStore> {
        let temp_dir = tempfile::tempdir()?;
        let state = CohortState::open(&temp_dir.path().join("state"))?;
        Ok(TestStateStore {
            state,
            _temp_dir: temp_dir,
        })
    }

    pub fn with_request(&self, id: &str) -> RequestId {
        let request = mock_request(id);
        let request_id = request.id.clone();
        self.state
            .write(RequestPayload::CreateRequest(CreateRequestRequest {
                request,
            }))
            .unwrap();
        request_id
    }

    pub fn with_root_snapshot(&self, request_id: &RequestId, id: &str) -> Result<SnapshotId> {
        let snapshot = mock_root_snapshot(id, request_id.get());
        let snapshot_id = snapshot.id.clone();
        self.state
            .write(RequestPayload::CreateSnapshot(CreateSnapshotRequest {
                snapshot,
            }))?;
        Ok(snapshot_id)
    }

    pub fn with_branch(
        &self,
        request_id: &RequestId,
        previous_id: &SnapshotId,
        id: &str,
        payload: &str,
    ) -> Result<SnapshotId> {
        let snapshot = mock_branch_snapshot(id, request_id.get(), previous_id.get(), payload);
        let snapshot_id = snapshot.id.clone();
        self.state
            .write(RequestPayload::CreateSnapshot(CreateSnapshotRequest {
                snapshot,
            }))?;
        Ok(snapshot_id)
    }

    pub fn with_measure(
        &self,
        request_id: &RequestId,
        snapshot_id: &SnapshotId,
    ) -> Result<MeasureId> {
        let measure = mock_measure(snapshot_id.get(), request_id.get());
        let measure_id = measure.id.clone();
        self.state
            .write(RequestPayload::CreateMeasure(CreateMeasureRequest {
                measure,
            }))?;
        Ok(measure_id)
    }

    pub fn with_cohort(
        &self,
        request_id: &RequestId,
        snapshot_id: &SnapshotId,
        measure_id: &MeasureId,
    ) -> Result<CohortId> {
        let cohort = mock_cohort(snapshot_id.get(), request_id.get(), measure_id.get());
        let cohort_id = cohort.id.clone();
        self.state
            .write(RequestPayload::CreateCohort(CreateCohortRequest {
                cohort,
                allow_system_kind: false,
            }))?;
        Ok(cohort_id)
    }
}
