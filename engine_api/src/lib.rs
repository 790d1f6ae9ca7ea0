pub mod http;
pub mod types;

use async_trait::async_trait;
pub use http::{EngineConfig, HttpComputeEngine};
pub use types::{
    AuthContext, CohortOutcome, CountOutcome, EngineError, EngineJobStatus, FormattedQuery,
    ValidateOutcome,
};

/// The external compute engine, seen from the dispatcher and the reconciler.
///
/// `count` and `materialize` block until the engine answers; callers run them
/// off the request path and bound them with the client's request timeout. An
/// `Ok` return is a successful outcome payload; every non-success shape the
/// engine can produce arrives as an `EngineError`.
#[async_trait]
pub trait ComputeEngine: Send + Sync + 'static {
    /// Pre-flight format check, called before a snapshot is accepted.
    async fn validate(
        &self,
        query: &FormattedQuery,
        auth: &AuthContext,
    ) -> Result<ValidateOutcome, EngineError>;

    /// Size estimation for a query.
    async fn count(
        &self,
        query: &FormattedQuery,
        auth: &AuthContext,
    ) -> Result<CountOutcome, EngineError>;

    /// Cohort materialization; the engine answers with a combined
    /// count-plus-group payload.
    async fn materialize(
        &self,
        query: &FormattedQuery,
        auth: &AuthContext,
    ) -> Result<CohortOutcome, EngineError>;

    /// Poll a job the engine already knows about.
    async fn status(&self, job_id: &str, auth: &AuthContext)
        -> Result<EngineJobStatus, EngineError>;

    /// Best-effort abort. The engine reports the status the job landed in.
    async fn cancel(&self, job_id: &str, auth: &AuthContext)
        -> Result<EngineJobStatus, EngineError>;
}
