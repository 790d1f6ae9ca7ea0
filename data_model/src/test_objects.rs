pub mod tests {
    use crate::{
        CohortId, CohortResult, CohortResultBuilder, DatedMeasure, DatedMeasureBuilder,
        MeasureId, QuerySnapshot, QuerySnapshotBuilder, Request, RequestBuilder, RequestId,
        SnapshotId,
    };

    pub const TEST_OWNER: &str = "analyst_1";

    pub fn mock_request(id: &str) -> Request {
        RequestBuilder::default()
            .id(RequestId::from(id))
            .owner(TEST_OWNER.to_string())
            .name(format!("request {}", id))
            .description("diabetic patients over 50".to_string())
            .build()
            .unwrap()
    }

    pub fn mock_root_snapshot(id: &str, request_id: &str) -> QuerySnapshot {
        QuerySnapshotBuilder::default()
            .id(SnapshotId::from(id))
            .request_id(RequestId::from(request_id))
            .owner(TEST_OWNER.to_string())
            .payload("{}".to_string())
            .build()
            .unwrap()
    }

    pub fn mock_branch_snapshot(
        id: &str,
        request_id: &str,
        previous_id: &str,
        payload: &str,
    ) -> QuerySnapshot {
        QuerySnapshotBuilder::default()
            .id(SnapshotId::from(id))
            .request_id(RequestId::from(request_id))
            .owner(TEST_OWNER.to_string())
            .previous_id(Some(SnapshotId::from(previous_id)))
            .payload(payload.to_string())
            .build()
            .unwrap()
    }

    pub fn mock_measure(snapshot_id: &str, request_id: &str) -> DatedMeasure {
        DatedMeasureBuilder::default()
            .id(MeasureId::generate())
            .snapshot_id(SnapshotId::from(snapshot_id))
            .request_id(RequestId::from(request_id))
            .owner(TEST_OWNER.to_string())
            .build()
            .unwrap()
    }

    pub fn mock_cohort(snapshot_id: &str, request_id: &str, measure_id: &str) -> CohortResult {
        CohortResultBuilder::default()
            .id(CohortId::generate())
            .snapshot_id(SnapshotId::from(snapshot_id))
            .request_id(RequestId::from(request_id))
            .measure_id(MeasureId::from(measure_id))
            .owner(TEST_OWNER.to_string())
            .name("my cohort".to_string())
            .build()
            .unwrap()
    }
}
