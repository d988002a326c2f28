//! Configuration loading.
//!
//! Values come from defaults, an optional `config/settings.*` file, and
//! `NOTAFLOW`-prefixed environment variables with `__` as the section
//! separator (e.g. `NOTAFLOW__QUEUE__URL`).

use std::path::PathBuf;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;

use crate::pipeline::worker::WorkerOptions;

const CONFIG_FILE: &str = "config/settings";
const ENV_PREFIX: &str = "NOTAFLOW";

#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error(transparent)]
    Build(#[from] config::ConfigError),
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub queue: QueueConfig,
    pub store: StoreConfig,
    pub database: DatabaseConfig,
    pub worker: WorkerConfig,
    #[serde(default)]
    pub extract: ExtractConfig,
    pub transform: TransformConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    /// Main queue URL. Required.
    pub url: String,
    /// Optional dead-letter sink for poison messages.
    pub dead_letter_url: Option<String>,
    pub max_receive_count: u32,
    pub visibility_timeout_secs: u64,
    /// Processing time after which visibility extension kicks in.
    pub extend_threshold_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    /// Bucket the source documents land in. Required.
    pub bucket: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    /// Postgres connection URL. Required.
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkerConfig {
    pub concurrency: usize,
    pub batch_size: u32,
    pub poll_interval_secs: u64,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ExtractConfig {
    pub section_start: Option<String>,
    pub section_end: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TransformConfig {
    pub date_format: String,
    /// Optional JSON file holding the declarative field rules.
    pub rules_path: Option<PathBuf>,
}

impl AppConfig {
    pub fn worker_options(&self) -> WorkerOptions {
        WorkerOptions {
            batch_size: self.worker.batch_size,
            visibility_timeout: Duration::from_secs(self.queue.visibility_timeout_secs),
            extend_threshold: Duration::from_secs(self.queue.extend_threshold_secs),
            max_receive_count: self.queue.max_receive_count,
            poll_interval: Duration::from_secs(self.worker.poll_interval_secs),
        }
    }
}

pub fn load() -> Result<AppConfig, AppConfigError> {
    let builder = Config::builder()
        .set_default("queue.max_receive_count", 5_u32)?
        .set_default("queue.visibility_timeout_secs", 60_u64)?
        .set_default("queue.extend_threshold_secs", 30_u64)?
        .set_default("database.max_connections", 5_u64)?
        .set_default("worker.concurrency", 4_u64)?
        .set_default("worker.batch_size", 10_u64)?
        .set_default("worker.poll_interval_secs", 5_u64)?
        .set_default("transform.date_format", "%d/%m/%Y")?
        .add_source(File::with_name(CONFIG_FILE).required(false))
        .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let cfg = builder.build()?.try_deserialize()?;
    Ok(cfg)
}
