use std::collections::HashMap;

use data_model::JobStatus;
use serde::{Deserialize, Serialize};

/// A query already translated into the engine's request format. The
/// translation layer itself lives outside this crate; callers hand the
/// finished text over and this boundary stays opaque about its contents.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FormattedQuery(String);

impl FormattedQuery {
    pub fn new(query: String) -> Self {
        Self(query)
    }

    pub fn get(&self) -> &str {
        &self.0
    }
}

/// Caller identity forwarded verbatim to the engine on every call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    authorization: String,
}

impl AuthContext {
    pub fn bearer(token: impl Into<String>) -> Self {
        Self {
            authorization: format!("Bearer {}", token.into()),
        }
    }

    pub fn header_value(&self) -> &str {
        &self.authorization
    }
}

/// Job status vocabulary as the engine reports it. Wider than the local
/// lifecycle; collapsed at the reconciliation boundary.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, strum::Display, strum::AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EngineJobStatus {
    Pending,
    Started,
    Running,
    Finished,
    Failed,
    Killed,
    Unknown,
}

impl EngineJobStatus {
    /// Maps into the local lifecycle. `Running` collapses into `Started`;
    /// `Unknown` has no local equivalent and the caller must treat it as a
    /// failure.
    pub fn to_job_status(self) -> Option<JobStatus> {
        match self {
            EngineJobStatus::Pending => Some(JobStatus::Pending),
            EngineJobStatus::Started | EngineJobStatus::Running => Some(JobStatus::Started),
            EngineJobStatus::Finished => Some(JobStatus::Finished),
            EngineJobStatus::Failed => Some(JobStatus::Failed),
            EngineJobStatus::Killed => Some(JobStatus::Killed),
            EngineJobStatus::Unknown => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            EngineJobStatus::Finished | EngineJobStatus::Failed | EngineJobStatus::Killed
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidateOutcome {
    pub success: bool,
    #[serde(default)]
    pub error_message: Option<String>,
}

/// Successful size-estimation payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CountOutcome {
    pub count: i64,
    #[serde(default)]
    pub counts_by_group: HashMap<String, i64>,
    pub computed_at: u64,
    pub job_id: String,
    pub duration_ms: u64,
    pub job_status: EngineJobStatus,
}

/// Successful materialization payload: a count outcome plus the opaque group
/// id identifying the materialized set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CohortOutcome {
    #[serde(flatten)]
    pub count: CountOutcome,
    pub group_id: String,
}

/// Everything the engine boundary can produce other than a success payload.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("engine rejected the job: {0}")]
    Rejected(String),
    #[error("engine request timed out")]
    Timeout,
    #[error("engine transport error: {0}")]
    Transport(String),
    #[error("engine returned a malformed response: {0}")]
    Malformed(String),
}

impl From<reqwest::Error> for EngineError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            EngineError::Timeout
        } else if err.is_decode() {
            EngineError::Malformed(err.to_string())
        } else {
            EngineError::Transport(err.to_string())
        }
    }
}
