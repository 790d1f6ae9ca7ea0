use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::debug;

use crate::{
    types::{AuthContext, CohortOutcome, CountOutcome, EngineError, FormattedQuery},
    ComputeEngine, EngineJobStatus, ValidateOutcome,
};

fn default_request_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub endpoint: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8090".to_string(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// HTTP client for the compute engine. One connection pool per process; the
/// request timeout bounds every call, so a hung engine surfaces as
/// `EngineError::Timeout` rather than a stuck worker.
pub struct HttpComputeEngine {
    client: reqwest::Client,
    config: EngineConfig,
}

#[derive(Serialize)]
struct JobRequestBody<'a> {
    query: &'a str,
}

#[derive(Deserialize)]
struct JobStatusBody {
    job_status: EngineJobStatus,
}

impl HttpComputeEngine {
    pub fn new(config: EngineConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.endpoint.trim_end_matches('/'), path)
    }

    async fn post_job<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &FormattedQuery,
        auth: &AuthContext,
    ) -> Result<T, EngineError> {
        let response = self
            .client
            .post(self.url(path))
            .header(reqwest::header::AUTHORIZATION, auth.header_value())
            .json(&JobRequestBody { query: query.get() })
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, EngineError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response.json::<T>().await?);
        }
        let body = response.text().await.unwrap_or_default();
        if status == StatusCode::REQUEST_TIMEOUT || status == StatusCode::GATEWAY_TIMEOUT {
            return Err(EngineError::Timeout);
        }
        Err(EngineError::Rejected(format!("{}: {}", status, body)))
    }
}

#[async_trait]
impl ComputeEngine for HttpComputeEngine {
    async fn validate(
        &self,
        query: &FormattedQuery,
        auth: &AuthContext,
    ) -> Result<ValidateOutcome, EngineError> {
        debug!("validating query against engine");
        self.post_job("jobs/validate", query, auth).await
    }

    async fn count(
        &self,
        query: &FormattedQuery,
        auth: &AuthContext,
    ) -> Result<CountOutcome, EngineError> {
        let outcome: CountOutcome = self.post_job("jobs/count", query, auth).await?;
        if outcome.job_status != EngineJobStatus::Finished {
            return Err(EngineError::Rejected(format!(
                "count job {} ended in status {}",
                outcome.job_id, outcome.job_status
            )));
        }
        Ok(outcome)
    }

    async fn materialize(
        &self,
        query: &FormattedQuery,
        auth: &AuthContext,
    ) -> Result<CohortOutcome, EngineError> {
        let outcome: CohortOutcome = self.post_job("jobs/cohort", query, auth).await?;
        if outcome.count.job_status != EngineJobStatus::Finished {
            return Err(EngineError::Rejected(format!(
                "materialization job {} ended in status {}",
                outcome.count.job_id, outcome.count.job_status
            )));
        }
        Ok(outcome)
    }

    async fn status(
        &self,
        job_id: &str,
        auth: &AuthContext,
    ) -> Result<EngineJobStatus, EngineError> {
        let response = self
            .client
            .get(self.url(&format!("jobs/{}", job_id)))
            .header(reqwest::header::AUTHORIZATION, auth.header_value())
            .send()
            .await?;
        let body: JobStatusBody = Self::decode(response).await?;
        Ok(body.job_status)
    }

    async fn cancel(
        &self,
        job_id: &str,
        auth: &AuthContext,
    ) -> Result<EngineJobStatus, EngineError> {
        let response = self
            .client
            .post(self.url(&format!("jobs/{}/cancel", job_id)))
            .header(reqwest::header::AUTHORIZATION, auth.header_value())
            .send()
            .await?;
        let body: JobStatusBody = Self::decode(response).await?;
        Ok(body.job_status)
    }
}
