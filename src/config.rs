use std::env;

use anyhow::Result;
use engine_api::EngineConfig;
use figment::{
    providers::{Format, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

fn default_queue_size() -> usize {
    128
}

fn default_lookup_max_attempts() -> u32 {
    5
}

fn default_lookup_backoff_ms() -> u64 {
    1000
}

/// Bounds on the reconciler's visibility-race retry loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobLookupConfig {
    #[serde(default = "default_lookup_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_lookup_backoff_ms")]
    pub backoff_ms: u64,
}

impl Default for JobLookupConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_lookup_max_attempts(),
            backoff_ms: default_lookup_backoff_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub state_store_path: String,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default = "default_queue_size")]
    pub job_queue_size: usize,
    #[serde(default)]
    pub job_lookup: JobLookupConfig,
    #[serde(default)]
    pub structured_logging: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let state_store_path = env::current_dir().unwrap().join("cohort_storage/state");
        ServerConfig {
            state_store_path: state_store_path.to_str().unwrap().to_string(),
            engine: EngineConfig::default(),
            job_queue_size: default_queue_size(),
            job_lookup: JobLookupConfig::default(),
            structured_logging: false,
        }
    }
}

impl ServerConfig {
    pub fn from_path(path: &str) -> Result<ServerConfig> {
        let config_str = std::fs::read_to_string(path)?;
        let config: ServerConfig = Figment::new().merge(Yaml::string(&config_str)).extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.state_store_path.is_empty() {
            return Err(anyhow::anyhow!("state_store_path must not be empty"));
        }
        if self.job_queue_size == 0 {
            return Err(anyhow::anyhow!("job_queue_size must be greater than zero"));
        }
        if self.job_lookup.max_attempts == 0 {
            return Err(anyhow::anyhow!(
                "job_lookup.max_attempts must be greater than zero"
            ));
        }
        if self.engine.endpoint.is_empty() {
            return Err(anyhow::anyhow!("engine.endpoint must not be empty"));
        }
        Ok(())
    }
}
