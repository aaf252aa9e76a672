use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_FILE: &str = "cvlac.toml";

/// Run configuration: defaults, then an optional TOML file, then `CVLAC_*`
/// environment variables. CLI flags are applied on top by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Document URL; `{id}` is replaced by the zero-padded entity ID.
    pub url_template: String,
    pub db_path: PathBuf,
    /// Checkpoint, processed list, error log and session reports live here.
    pub data_dir: PathBuf,
    pub start: u64,
    pub total: u64,
    pub shard_size: u64,
    pub workers: usize,
    pub fetch_timeout_secs: u64,
    pub db_busy_timeout_ms: u64,
    /// Fetched documents shorter than this are treated as empty.
    pub min_document_bytes: usize,
    pub update_existing: bool,
    pub report_flush_every: usize,
    pub entity_column: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            url_template: "https://scienti.minciencias.gov.co/cvlac/visualizador/generarCurriculoCv.do?cod_rh={id}"
                .to_string(),
            db_path: PathBuf::from("data/cvlac.sqlite"),
            data_dir: PathBuf::from("data"),
            start: 1,
            total: 1000,
            shard_size: 100,
            workers: 4,
            fetch_timeout_secs: 30,
            db_busy_timeout_ms: 5000,
            min_document_bytes: 512,
            update_existing: true,
            report_flush_every: 25,
            entity_column: "cvlac_id".to_string(),
        }
    }
}

impl Settings {
    /// Load from `path`, or from `cvlac.toml` in the working directory if it exists.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = path.unwrap_or(Path::new(DEFAULT_CONFIG_FILE));
        let settings: Settings = config::Config::builder()
            .add_source(config::File::from(file).required(path.is_some()))
            .add_source(config::Environment::with_prefix("CVLAC").try_parsing(true))
            .build()
            .with_context(|| format!("Failed to load configuration from {:?}", file))?
            .try_deserialize()
            .context("Invalid configuration")?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.shard_size == 0 {
            bail!("shard_size must be at least 1");
        }
        if self.workers == 0 {
            bail!("workers must be at least 1");
        }
        if !self.url_template.contains("{id}") {
            bail!("url_template must contain an {{id}} placeholder: {}", self.url_template);
        }
        if self.entity_column.trim().is_empty() {
            bail!("entity_column must not be empty");
        }
        Ok(())
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn db_busy_timeout(&self) -> Duration {
        Duration::from_millis(self.db_busy_timeout_ms)
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.data_dir.join("checkpoint.txt")
    }

    pub fn processed_path(&self) -> PathBuf {
        self.data_dir.join("processed.txt")
    }

    pub fn error_log_path(&self) -> PathBuf {
        self.data_dir.join("errors.log")
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.data_dir.join("sessions")
    }
}
