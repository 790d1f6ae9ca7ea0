use std::sync::Arc;

use anyhow::Result;
use processor::test_engine::StubEngine;
use tempfile::TempDir;
use tracing::subscriber;
use tracing_subscriber::{layer::SubscriberExt, Layer};

use crate::{
    config::{JobLookupConfig, ServerConfig},
    service::Service,
};

/// A fully wired service over a throwaway store and a stub engine, with the
/// background worker already running and fast lookup backoff.
pub struct TestService {
    pub service: Service,
    pub engine: Arc<StubEngine>,
    _temp_dir: TempDir,
}

impl TestService {
    pub fn new() -> Result<Self> {
        Self::with_engine(StubEngine::succeeding())
    }

    pub fn with_engine(engine: StubEngine) -> Result<Self> {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        let _ = subscriber::set_global_default(
            tracing_subscriber::registry()
                .with(tracing_subscriber::fmt::layer().with_filter(env_filter)),
        );

        let temp_dir = tempfile::tempdir()?;
        let config = ServerConfig {
            state_store_path: temp_dir
                .path()
                .join("state_store")
                .to_str()
                .unwrap()
                .to_string(),
            job_lookup: JobLookupConfig {
                max_attempts: 5,
                backoff_ms: 20,
            },
            ..Default::default()
        };

        let engine = Arc::new(engine);
        let service = Service::with_engine(config, engine.clone())?;
        service.start()?;
        Ok(Self {
            service,
            engine,
            _temp_dir: temp_dir,
        })
    }
}
