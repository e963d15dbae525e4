//! Extract -> transform -> load orchestration.

mod load;

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use cetl_core::{Identifier, TableName};
use cetl_extract::{FetchError, HttpClientConfig, HttpFetcher};
use cetl_transform::{transform, TransformError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub use load::{LoadError, LoadStep, LoadSummary, PgLoader, RecordSink};

pub const CRATE_NAME: &str = "cetl-sync";

pub const DEFAULT_SOURCE_URL: &str =
    "https://raw.githubusercontent.com/thesimonk/Resources/refs/heads/master/etl_files/sample.json";
pub const DEFAULT_TABLE: &str = "customers";

/// Load variables from `./.env` (or the nearest parent) into the process
/// environment. Variables already set win over the file. A missing file is
/// not an error and yields `None`.
pub fn load_dotenv() -> Result<Option<PathBuf>> {
    match dotenvy::dotenv() {
        Ok(path) => Ok(Some(path)),
        Err(err) if err.not_found() => Ok(None),
        Err(err) => Err(err).context("loading .env"),
    }
}

/// Like [`load_dotenv`] for an explicit file. Returns whether it was found.
pub fn load_dotenv_from(path: &Path) -> Result<bool> {
    match dotenvy::from_path(path) {
        Ok(()) => Ok(true),
        Err(err) if err.not_found() => Ok(false),
        Err(err) => Err(err).with_context(|| format!("loading {}", path.display())),
    }
}

/// Parse an optional variable, falling back to `default` when unset. A value
/// that is set but malformed is an error naming the variable.
fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(value) => value
            .trim()
            .parse()
            .with_context(|| format!("parsing {key}={value:?}")),
        None => Ok(default),
    }
}

/// PostgreSQL connection settings, read from `DB_*` variables.
#[derive(Clone)]
pub struct DbConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub schema: Identifier,
    pub user: String,
    pub password: String,
    pub connect_timeout_secs: u64,
}

impl DbConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let schema = lookup("DB_SCHEMA").unwrap_or_else(|| "public".to_string());
        Ok(Self {
            host: lookup("DB_HOST").unwrap_or_else(|| "localhost".to_string()),
            port: parse_var(&lookup, "DB_PORT", 5432)?,
            database: lookup("DB_NAME").context("DB_NAME is not set")?,
            schema: Identifier::parse(&schema)
                .with_context(|| format!("invalid DB_SCHEMA={schema:?}"))?,
            user: lookup("DB_USER").context("DB_USER is not set")?,
            password: lookup("DB_PASSWORD").unwrap_or_default(),
            connect_timeout_secs: parse_var(&lookup, "DB_CONNECT_TIMEOUT_SECS", 10)?,
        })
    }
}

impl fmt::Debug for DbConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("schema", &self.schema)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub source_url: String,
    pub table: TableName,
    pub user_agent: String,
    pub http_timeout_secs: u64,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let table = lookup("CETL_TABLE").unwrap_or_else(|| DEFAULT_TABLE.to_string());
        Ok(Self {
            source_url: lookup("CETL_SOURCE_URL").unwrap_or_else(|| DEFAULT_SOURCE_URL.to_string()),
            table: TableName::parse(&table).with_context(|| format!("invalid CETL_TABLE={table:?}"))?,
            user_agent: lookup("CETL_USER_AGENT").unwrap_or_else(|| "cetl/0.1".to_string()),
            http_timeout_secs: parse_var(&lookup, "CETL_HTTP_TIMEOUT_SECS", 20)?,
        })
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("extraction failed")]
    Extract(#[from] FetchError),
    #[error("transform failed")]
    Transform(#[from] TransformError),
    #[error("load failed")]
    Load(#[from] LoadError),
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub source_url: String,
    pub table: String,
    pub transformed_records: usize,
    /// `None` when there was nothing to transform and the load was skipped.
    pub loaded: Option<LoadSummary>,
}

pub struct SyncPipeline {
    config: SyncConfig,
    http: HttpFetcher,
    sink: Box<dyn RecordSink>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig, sink: Box<dyn RecordSink>) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
        })?;
        Ok(Self { config, http, sink })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary, PipelineError> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id, table = %self.config.table);

        async {
            let data = self.http.fetch_json(run_id, &self.config.source_url).await?;

            let batch = transform(Some(data))
                .inspect_err(|err| warn!(error = %err, "transform failed; nothing loaded"))?;

            let (transformed_records, loaded) = match batch {
                Some(batch) => {
                    let summary = self.sink.load(&batch, &self.config.table).await?;
                    (batch.len(), Some(summary))
                }
                None => {
                    info!("nothing to load");
                    (0, None)
                }
            };

            Ok::<_, PipelineError>(SyncRunSummary {
                run_id,
                started_at,
                finished_at: Utc::now(),
                source_url: self.config.source_url.clone(),
                table: self.config.table.to_string(),
                transformed_records,
                loaded,
            })
        }
        .instrument(span)
        .await
    }
}

/// Build a pipeline against PostgreSQL and run it once. The database is not
/// contacted until there is a batch to load.
pub async fn run_sync_once(config: SyncConfig, db: &DbConfig) -> Result<SyncRunSummary> {
    let loader = PgLoader::connect_lazy(db);
    let pipeline = SyncPipeline::new(config, Box::new(loader))?;
    Ok(pipeline.run_once().await?)
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    let config = SyncConfig::from_env()?;
    let db = DbConfig::from_env()?;
    run_sync_once(config, &db).await
}
