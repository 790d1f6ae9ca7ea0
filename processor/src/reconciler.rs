use std::sync::Arc;

use cohort_utils::retry::{retry_until_some, RetryOutcome, RetryPolicy};
use data_model::{CohortId, DomainError, JobHandle, JobRecordRef, MeasureId};
use engine_api::{CohortOutcome, ComputeEngine, CountOutcome, EngineError};
use metrics::{job_metrics, GaugeGuard};
use state_store::{
    requests::{
        CohortJobOutcome, CohortJobSuccess, FinalizeCohortJobRequest, FinalizeMeasureJobRequest,
        JobFailure, MarkJobStartedRequest, MeasureJobOutcome, MeasureJobSuccess, RequestPayload,
    },
    CohortState,
};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::queue::JobEnvelope;

/// Resolves dispatched jobs into terminal record state.
///
/// A reconciliation never raises to the worker loop: every path ends in a
/// terminal write, or in a logged abandonment when there is no record left to
/// write to. Nothing here re-submits work to the engine; a failed job stays
/// failed until a user asks again.
pub struct JobReconciler {
    state: Arc<CohortState>,
    engine: Arc<dyn ComputeEngine>,
    metrics: Arc<job_metrics::Metrics>,
    lookup_policy: RetryPolicy,
}

impl JobReconciler {
    pub fn new(
        state: Arc<CohortState>,
        engine: Arc<dyn ComputeEngine>,
        metrics: Arc<job_metrics::Metrics>,
    ) -> Self {
        Self {
            state,
            engine,
            metrics,
            lookup_policy: RetryPolicy::default(),
        }
    }

    /// Shrinks the visibility-race backoff; tests use this to avoid real
    /// one-second sleeps.
    pub fn with_lookup_policy(mut self, lookup_policy: RetryPolicy) -> Self {
        self.lookup_policy = lookup_policy;
        self
    }

    pub async fn reconcile(&self, envelope: JobEnvelope, shutdown: &mut watch::Receiver<()>) {
        let _inflight = GaugeGuard::new(&self.metrics.jobs_inflight);
        match envelope.record.clone() {
            JobRecordRef::Measure(measure_id) => {
                self.reconcile_measure(measure_id, envelope, shutdown).await
            }
            JobRecordRef::Cohort(cohort_id) => {
                self.reconcile_cohort(cohort_id, envelope, shutdown).await
            }
        }
    }

    /// Step 1 of every reconciliation: the record is created by the same
    /// operation that enqueued this job, so it may not be visible yet.
    /// Bounded retry; exhaustion is terminal because there is no row to mark
    /// failed.
    async fn lookup<T, F>(
        &self,
        record: &JobRecordRef,
        shutdown: &mut watch::Receiver<()>,
        load: F,
    ) -> Option<T>
    where
        F: Fn() -> anyhow::Result<Option<T>>,
    {
        let outcome = retry_until_some(self.lookup_policy, shutdown, || {
            let loaded = load();
            async move { loaded }
        })
        .await;
        match outcome {
            Ok(RetryOutcome::Found(found)) => Some(found),
            Ok(RetryOutcome::Exhausted) => {
                error!(
                    record = record.to_string(),
                    attempts = self.lookup_policy.max_attempts,
                    "record never became visible, abandoning job"
                );
                self.metrics.jobs_abandoned.add(1);
                None
            }
            Ok(RetryOutcome::Cancelled) => {
                info!(
                    record = record.to_string(),
                    "shutdown during record lookup, abandoning job"
                );
                None
            }
            Err(err) => {
                error!(
                    record = record.to_string(),
                    "error loading record, abandoning job: {:?}", err
                );
                self.metrics.jobs_abandoned.add(1);
                None
            }
        }
    }

    /// Flips the record to `Started` before the engine call. A rejection
    /// means a cancellation landed between dispatch and pickup; the job stops
    /// there.
    fn mark_started(&self, record: &JobRecordRef) -> bool {
        match self
            .state
            .write(RequestPayload::MarkJobStarted(MarkJobStartedRequest {
                record: record.clone(),
            })) {
            Ok(()) => true,
            Err(err) if err.downcast_ref::<DomainError>().is_some() => {
                info!(
                    record = record.to_string(),
                    "record already resolved or killed, skipping engine call"
                );
                false
            }
            Err(err) => {
                error!(
                    record = record.to_string(),
                    "error marking job started, abandoning job: {:?}", err
                );
                self.metrics.jobs_abandoned.add(1);
                false
            }
        }
    }

    async fn reconcile_measure(
        &self,
        measure_id: MeasureId,
        envelope: JobEnvelope,
        shutdown: &mut watch::Receiver<()>,
    ) {
        let reader = self.state.reader();
        let Some(measure) = self
            .lookup(&envelope.record, shutdown, || reader.get_measure(&measure_id))
            .await
        else {
            return;
        };
        if measure.job_status.is_terminal() {
            info!(
                measure_id = measure_id.get(),
                "measure already terminal, nothing to reconcile"
            );
            return;
        }
        if !self.mark_started(&envelope.record) {
            return;
        }

        info!(measure_id = measure_id.get(), "asking engine for count");
        let outcome = match self.engine.count(&envelope.query, &envelope.auth).await {
            Ok(count) => {
                self.metrics.jobs_finished.add(1);
                MeasureJobOutcome::Success(measure_success(count))
            }
            Err(err) => {
                self.metrics.jobs_failed.add(1);
                warn!(
                    measure_id = measure_id.get(),
                    "count job failed: {}", err
                );
                MeasureJobOutcome::Failure(job_failure(err))
            }
        };
        let result = self
            .state
            .write(RequestPayload::FinalizeMeasureJob(FinalizeMeasureJobRequest {
                measure_id: measure_id.clone(),
                outcome,
            }));
        log_finalize_result(&envelope.record, result);
    }

    async fn reconcile_cohort(
        &self,
        cohort_id: CohortId,
        envelope: JobEnvelope,
        shutdown: &mut watch::Receiver<()>,
    ) {
        let reader = self.state.reader();
        let Some(cohort) = self
            .lookup(&envelope.record, shutdown, || reader.get_cohort(&cohort_id))
            .await
        else {
            return;
        };
        if cohort.job_status.is_terminal() {
            info!(
                cohort_id = cohort_id.get(),
                "cohort already terminal, nothing to reconcile"
            );
            return;
        }
        if !self.mark_started(&envelope.record) {
            return;
        }

        info!(
            cohort_id = cohort_id.get(),
            "asking engine to materialize cohort"
        );
        let outcome = match self
            .engine
            .materialize(&envelope.query, &envelope.auth)
            .await
        {
            Ok(outcome) => {
                self.metrics.jobs_finished.add(1);
                CohortJobOutcome::Success(cohort_success(outcome))
            }
            Err(err) => {
                self.metrics.jobs_failed.add(1);
                warn!(
                    cohort_id = cohort_id.get(),
                    "materialization job failed: {}", err
                );
                CohortJobOutcome::Failure(job_failure(err))
            }
        };
        let result = self
            .state
            .write(RequestPayload::FinalizeCohortJob(FinalizeCohortJobRequest {
                cohort_id: cohort_id.clone(),
                outcome,
            }));
        log_finalize_result(&envelope.record, result);
    }
}

fn measure_success(outcome: CountOutcome) -> MeasureJobSuccess {
    MeasureJobSuccess {
        value: outcome.count,
        computed_at: outcome.computed_at,
        engine_job_id: JobHandle::new(outcome.job_id),
        duration_ms: outcome.duration_ms,
    }
}

fn cohort_success(outcome: CohortOutcome) -> CohortJobSuccess {
    CohortJobSuccess {
        group_id: outcome.group_id,
        value: outcome.count.count,
        computed_at: outcome.count.computed_at,
        engine_job_id: JobHandle::new(outcome.count.job_id),
        duration_ms: outcome.count.duration_ms,
    }
}

fn job_failure(err: EngineError) -> JobFailure {
    JobFailure {
        message: err.to_string(),
        engine_job_id: None,
        duration_ms: None,
    }
}

fn log_finalize_result(record: &JobRecordRef, result: anyhow::Result<()>) {
    match result {
        Ok(()) => info!(record = record.to_string(), "job outcome recorded"),
        Err(err) if err.downcast_ref::<DomainError>().is_some() => {
            // Killed while the engine call was in flight; the terminal state
            // on the record wins.
            info!(
                record = record.to_string(),
                "record resolved concurrently, outcome dropped: {}", err
            );
        }
        Err(err) => {
            error!(
                record = record.to_string(),
                "error recording job outcome: {:?}", err
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::atomic::Ordering, time::Duration};

    use anyhow::Result;
    use data_model::{DatedMeasureBuilder, JobStatus, test_objects::tests::TEST_OWNER};
    use engine_api::{AuthContext, FormattedQuery};
    use state_store::{
        requests::{CreateMeasureRequest, KillJobRequest},
        test_state_store::TestStateStore,
    };

    use super::*;
    use crate::test_engine::StubEngine;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 5,
            backoff: Duration::from_millis(50),
        }
    }

    fn envelope_for(record: JobRecordRef) -> JobEnvelope {
        JobEnvelope {
            record,
            job_handle: JobHandle::generate(),
            query: FormattedQuery::new("{}".to_string()),
            auth: AuthContext::bearer("token"),
        }
    }

    fn reconciler_for(
        store: &TestStateStore,
        engine: Arc<StubEngine>,
        metrics: Arc<job_metrics::Metrics>,
    ) -> JobReconciler {
        JobReconciler::new(store.state.clone(), engine, metrics)
            .with_lookup_policy(fast_policy())
    }

    #[tokio::test]
    async fn test_reconcile_measure_success() -> Result<()> {
        let store = TestStateStore::new()?;
        let request_id = store.with_request("req_a");
        let s1 = store.with_root_snapshot(&request_id, "s1")?;
        let measure_id = store.with_measure(&request_id, &s1)?;
        let engine = Arc::new(StubEngine::succeeding());
        let metrics = Arc::new(job_metrics::Metrics::new());
        let reconciler = reconciler_for(&store, engine.clone(), metrics.clone());
        let (_tx, mut shutdown) = watch::channel(());

        reconciler
            .reconcile(
                envelope_for(JobRecordRef::Measure(measure_id.clone())),
                &mut shutdown,
            )
            .await;

        let measure = store.state.reader().get_measure(&measure_id)?.unwrap();
        assert_eq!(measure.job_status, JobStatus::Finished);
        assert_eq!(measure.value, Some(120));
        assert_eq!(measure.computed_at, Some(1_700_000_000_000));
        assert_eq!(measure.job_handle, Some(JobHandle::from("engine-job-1")));
        assert_eq!(engine.count_calls.load(Ordering::SeqCst), 1);
        assert_eq!(metrics.jobs_finished.get(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_reconcile_measure_failure() -> Result<()> {
        let store = TestStateStore::new()?;
        let request_id = store.with_request("req_a");
        let s1 = store.with_root_snapshot(&request_id, "s1")?;
        let measure_id = store.with_measure(&request_id, &s1)?;
        let engine = Arc::new(StubEngine::failing("index backend unavailable"));
        let metrics = Arc::new(job_metrics::Metrics::new());
        let reconciler = reconciler_for(&store, engine, metrics.clone());
        let (_tx, mut shutdown) = watch::channel(());

        reconciler
            .reconcile(
                envelope_for(JobRecordRef::Measure(measure_id.clone())),
                &mut shutdown,
            )
            .await;

        let measure = store.state.reader().get_measure(&measure_id)?.unwrap();
        assert_eq!(measure.job_status, JobStatus::Failed);
        assert!(measure
            .failure_message
            .as_deref()
            .unwrap()
            .contains("index backend unavailable"));
        assert!(measure.value.is_none());
        assert!(measure.computed_at.is_none());
        assert_eq!(metrics.jobs_failed.get(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_reconcile_cohort_success_fills_both_rows() -> Result<()> {
        let store = TestStateStore::new()?;
        let request_id = store.with_request("req_a");
        let s1 = store.with_root_snapshot(&request_id, "s1")?;
        let measure_id = store.with_measure(&request_id, &s1)?;
        let cohort_id = store.with_cohort(&request_id, &s1, &measure_id)?;
        let engine = Arc::new(StubEngine::succeeding());
        let metrics = Arc::new(job_metrics::Metrics::new());
        let reconciler = reconciler_for(&store, engine.clone(), metrics);
        let (_tx, mut shutdown) = watch::channel(());

        reconciler
            .reconcile(
                envelope_for(JobRecordRef::Cohort(cohort_id.clone())),
                &mut shutdown,
            )
            .await;

        let reader = store.state.reader();
        let cohort = reader.get_cohort(&cohort_id)?.unwrap();
        assert_eq!(cohort.job_status, JobStatus::Finished);
        assert_eq!(cohort.group_id.as_deref(), Some("grp-1"));
        let measure = reader.get_measure(&measure_id)?.unwrap();
        assert_eq!(measure.job_status, JobStatus::Finished);
        assert_eq!(measure.value, Some(120));
        assert_eq!(engine.materialize_calls.load(Ordering::SeqCst), 1);
        assert_eq!(engine.count_calls.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_reconcile_cohort_failure_fails_both_rows() -> Result<()> {
        let store = TestStateStore::new()?;
        let request_id = store.with_request("req_a");
        let s1 = store.with_root_snapshot(&request_id, "s1")?;
        let measure_id = store.with_measure(&request_id, &s1)?;
        let cohort_id = store.with_cohort(&request_id, &s1, &measure_id)?;
        let engine = Arc::new(StubEngine::failing("group creation refused"));
        let metrics = Arc::new(job_metrics::Metrics::new());
        let reconciler = reconciler_for(&store, engine, metrics);
        let (_tx, mut shutdown) = watch::channel(());

        reconciler
            .reconcile(
                envelope_for(JobRecordRef::Cohort(cohort_id.clone())),
                &mut shutdown,
            )
            .await;

        let reader = store.state.reader();
        let cohort = reader.get_cohort(&cohort_id)?.unwrap();
        let measure = reader.get_measure(&measure_id)?.unwrap();
        // Never one failed and the other still pending.
        assert_eq!(cohort.job_status, JobStatus::Failed);
        assert_eq!(measure.job_status, JobStatus::Failed);
        assert!(cohort
            .failure_message
            .as_deref()
            .unwrap()
            .contains("group creation refused"));
        Ok(())
    }

    #[tokio::test]
    async fn test_lookup_retry_resolves_late_record() -> Result<()> {
        let store = Arc::new(TestStateStore::new()?);
        let request_id = store.with_request("req_a");
        let s1 = store.with_root_snapshot(&request_id, "s1")?;
        let engine = Arc::new(StubEngine::succeeding());
        let metrics = Arc::new(job_metrics::Metrics::new());
        let reconciler = reconciler_for(&store, engine.clone(), metrics.clone());
        let (_tx, mut shutdown) = watch::channel(());

        // The row lands only after a couple of lookup attempts, as it does
        // when the creating transaction commits behind the worker.
        let late_store = store.clone();
        let late_request = request_id.clone();
        let late_snapshot = s1.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(120)).await;
            let measure = DatedMeasureBuilder::default()
                .id("m-late".into())
                .snapshot_id(late_snapshot)
                .request_id(late_request)
                .owner(TEST_OWNER.to_string())
                .build()
                .unwrap();
            late_store
                .state
                .write(RequestPayload::CreateMeasure(CreateMeasureRequest {
                    measure,
                }))
                .unwrap();
        });

        reconciler
            .reconcile(
                envelope_for(JobRecordRef::Measure("m-late".into())),
                &mut shutdown,
            )
            .await;

        // Resolved exactly as if the row had been visible on the first try.
        let measure = store
            .state
            .reader()
            .get_measure(&"m-late".into())?
            .unwrap();
        assert_eq!(measure.job_status, JobStatus::Finished);
        assert_eq!(measure.value, Some(120));
        assert_eq!(metrics.jobs_abandoned.get(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_record_abandoned_without_panic() -> Result<()> {
        let store = TestStateStore::new()?;
        let engine = Arc::new(StubEngine::succeeding());
        let metrics = Arc::new(job_metrics::Metrics::new());
        let reconciler = JobReconciler::new(
            store.state.clone(),
            engine.clone(),
            metrics.clone(),
        )
        .with_lookup_policy(RetryPolicy {
            max_attempts: 3,
            backoff: Duration::from_millis(5),
        });
        let (_tx, mut shutdown) = watch::channel(());

        reconciler
            .reconcile(
                envelope_for(JobRecordRef::Measure("ghost".into())),
                &mut shutdown,
            )
            .await;

        // No engine call, nothing written, one abandonment accounted for.
        assert_eq!(engine.count_calls.load(Ordering::SeqCst), 0);
        assert_eq!(metrics.jobs_abandoned.get(), 1);
        assert!(store
            .state
            .reader()
            .get_measure(&"ghost".into())?
            .is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_killed_record_skips_engine_call() -> Result<()> {
        let store = TestStateStore::new()?;
        let request_id = store.with_request("req_a");
        let s1 = store.with_root_snapshot(&request_id, "s1")?;
        let measure_id = store.with_measure(&request_id, &s1)?;
        store
            .state
            .write(RequestPayload::KillJob(KillJobRequest {
                record: JobRecordRef::Measure(measure_id.clone()),
            }))?;
        let engine = Arc::new(StubEngine::succeeding());
        let metrics = Arc::new(job_metrics::Metrics::new());
        let reconciler = reconciler_for(&store, engine.clone(), metrics);
        let (_tx, mut shutdown) = watch::channel(());

        reconciler
            .reconcile(
                envelope_for(JobRecordRef::Measure(measure_id.clone())),
                &mut shutdown,
            )
            .await;

        assert_eq!(engine.count_calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            store.state.reader().get_measure(&measure_id)?.unwrap().job_status,
            JobStatus::Killed
        );
        Ok(())
    }
}
