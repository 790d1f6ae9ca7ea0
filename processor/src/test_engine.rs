use std::{
    collections::HashMap,
    sync::atomic::{AtomicU32, Ordering},
};

use async_trait::async_trait;
use engine_api::{
    AuthContext, CohortOutcome, ComputeEngine, CountOutcome, EngineError, EngineJobStatus,
    FormattedQuery, ValidateOutcome,
};

/// Canned compute engine for tests: fixed responses, call counters. Stubbing
/// the trait keeps job tests off the network entirely.
pub struct StubEngine {
    pub validate_calls: AtomicU32,
    pub count_calls: AtomicU32,
    pub materialize_calls: AtomicU32,
    pub cancel_calls: AtomicU32,
    validate_response: Result<ValidateOutcome, EngineError>,
    count_response: Result<CountOutcome, EngineError>,
    materialize_response: Result<CohortOutcome, EngineError>,
    cancel_response: Result<EngineJobStatus, EngineError>,
}

impl StubEngine {
    pub fn succeeding() -> Self {
        let count = CountOutcome {
            count: 120,
            counts_by_group: HashMap::new(),
            computed_at: 1_700_000_000_000,
            job_id: "engine-job-1".to_string(),
            duration_ms: 250,
            job_status: EngineJobStatus::Finished,
        };
        Self {
            validate_calls: AtomicU32::new(0),
            count_calls: AtomicU32::new(0),
            materialize_calls: AtomicU32::new(0),
            cancel_calls: AtomicU32::new(0),
            validate_response: Ok(ValidateOutcome {
                success: true,
                error_message: None,
            }),
            count_response: Ok(count.clone()),
            materialize_response: Ok(CohortOutcome {
                count,
                group_id: "grp-1".to_string(),
            }),
            cancel_response: Ok(EngineJobStatus::Killed),
        }
    }

    pub fn failing(message: &str) -> Self {
        let mut engine = Self::succeeding();
        engine.validate_response = Ok(ValidateOutcome {
            success: false,
            error_message: Some(message.to_string()),
        });
        engine.count_response = Err(EngineError::Rejected(message.to_string()));
        engine.materialize_response = Err(EngineError::Rejected(message.to_string()));
        engine
    }

    pub fn with_count_response(mut self, response: Result<CountOutcome, EngineError>) -> Self {
        self.count_response = response;
        self
    }

    pub fn with_materialize_response(
        mut self,
        response: Result<CohortOutcome, EngineError>,
    ) -> Self {
        self.materialize_response = response;
        self
    }

    pub fn with_validate_response(
        mut self,
        response: Result<ValidateOutcome, EngineError>,
    ) -> Self {
        self.validate_response = response;
        self
    }

    pub fn with_cancel_response(mut self, response: Result<EngineJobStatus, EngineError>) -> Self {
        self.cancel_response = response;
        self
    }
}

#[async_trait]
impl ComputeEngine for StubEngine {
    async fn validate(
        &self,
        _query: &FormattedQuery,
        _auth: &AuthContext,
    ) -> Result<ValidateOutcome, EngineError> {
        self.validate_calls.fetch_add(1, Ordering::SeqCst);
        self.validate_response.clone()
    }

    async fn count(
        &self,
        _query: &FormattedQuery,
        _auth: &AuthContext,
    ) -> Result<CountOutcome, EngineError> {
        self.count_calls.fetch_add(1, Ordering::SeqCst);
        self.count_response.clone()
    }

    async fn materialize(
        &self,
        _query: &FormattedQuery,
        _auth: &AuthContext,
    ) -> Result<CohortOutcome, EngineError> {
        self.materialize_calls.fetch_add(1, Ordering::SeqCst);
        self.materialize_response.clone()
    }

    async fn status(
        &self,
        _job_id: &str,
        _auth: &AuthContext,
    ) -> Result<EngineJobStatus, EngineError> {
        Ok(EngineJobStatus::Finished)
    }

    async fn cancel(
        &self,
        _job_id: &str,
        _auth: &AuthContext,
    ) -> Result<EngineJobStatus, EngineError> {
        self.cancel_calls.fetch_add(1, Ordering::SeqCst);
        self.cancel_response.clone()
    }
}
