//! Transactional staged upsert into PostgreSQL.
//!
//! One transaction per load: replace the `<table>_temp` staging relation,
//! materialize the batch into it, create the target if missing, merge with
//! `ON CONFLICT (id) DO UPDATE`, drop staging, commit. PostgreSQL DDL is
//! transactional, so a failure at any step leaves neither a changed target
//! nor a stray staging table behind.
//!
//! PostgreSQL could take the batch straight into the target with a single
//! `INSERT ... ON CONFLICT`; the staging table is kept so the same sequence
//! works on engines without native upsert, and so type errors in the batch
//! surface before the target is touched.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use cetl_core::{Batch, Identifier, QualifiedTable, TableName};
use serde::Serialize;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{PgConnection, PgPool};
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};

use crate::DbConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LoadStep {
    Stage,
    EnsureTarget,
    Upsert,
    DropStaging,
    Commit,
}

impl fmt::Display for LoadStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LoadStep::Stage => "stage batch",
            LoadStep::EnsureTarget => "ensure target table",
            LoadStep::Upsert => "upsert from staging",
            LoadStep::DropStaging => "drop staging table",
            LoadStep::Commit => "commit",
        })
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    /// No connection could be acquired, or `BEGIN` itself failed.
    #[error("connecting to postgres")]
    Connect(#[source] sqlx::Error),
    #[error("{step} failed")]
    Step {
        step: LoadStep,
        #[source]
        source: sqlx::Error,
    },
}

impl LoadError {
    fn at(step: LoadStep) -> impl FnOnce(sqlx::Error) -> LoadError {
        move |source| LoadError::Step { step, source }
    }

    pub fn step(&self) -> Option<LoadStep> {
        match self {
            LoadError::Connect(_) => None,
            LoadError::Step { step, .. } => Some(*step),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadSummary {
    pub table: String,
    pub staged_rows: u64,
    pub upserted_rows: u64,
}

/// Destination for a transformed batch.
#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn load(&self, batch: &Batch, table: &TableName) -> Result<LoadSummary, LoadError>;
}

#[derive(Debug, Clone)]
pub struct PgLoader {
    pool: PgPool,
    schema: Identifier,
}

impl PgLoader {
    pub fn new(pool: PgPool, schema: Identifier) -> Self {
        Self { pool, schema }
    }

    /// Build a single-connection pool without touching the network; the
    /// first connection is opened by the first load. Must be called from
    /// within a Tokio runtime.
    pub fn connect_lazy(config: &DbConfig) -> Self {
        let options = PgConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .database(&config.database)
            .username(&config.user)
            .password(&config.password);
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .connect_lazy_with(options);
        Self::new(pool, config.schema.clone())
    }

    pub fn schema(&self) -> &Identifier {
        &self.schema
    }

    /// Create the target table if it does not exist, without loading anything.
    pub async fn ensure_target(&self, table: &TableName) -> Result<(), LoadError> {
        let target = table.qualified(&self.schema);
        let mut tx = self.pool.begin().await.map_err(LoadError::Connect)?;
        sqlx::query(&create_target_sql(&target))
            .execute(&mut *tx)
            .await
            .map_err(LoadError::at(LoadStep::EnsureTarget))?;
        tx.commit().await.map_err(LoadError::at(LoadStep::Commit))?;
        info!(table = %target.display_name(), "target table ensured");
        Ok(())
    }

    async fn load_in_transaction(
        &self,
        batch: &Batch,
        target: &QualifiedTable,
        staging: &QualifiedTable,
    ) -> Result<LoadSummary, LoadError> {
        let mut tx = self.pool.begin().await.map_err(LoadError::Connect)?;

        match run_steps(&mut tx, batch, target, staging).await {
            Ok(summary) => {
                tx.commit().await.map_err(LoadError::at(LoadStep::Commit))?;
                Ok(summary)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(
                        error = &rollback_err as &dyn std::error::Error,
                        "rollback failed; connection will be discarded"
                    );
                }
                Err(err)
            }
        }
    }
}

#[async_trait]
impl RecordSink for PgLoader {
    async fn load(&self, batch: &Batch, table: &TableName) -> Result<LoadSummary, LoadError> {
        let target = table.qualified(&self.schema);
        let staging = table.staging_in(&self.schema);
        let span = info_span!("load", table = %target.display_name(), rows = batch.len());

        async {
            match self.load_in_transaction(batch, &target, &staging).await {
                Ok(summary) => {
                    info!(
                        staged = summary.staged_rows,
                        upserted = summary.upserted_rows,
                        "data upserted into {}",
                        summary.table
                    );
                    Ok(summary)
                }
                Err(err) => {
                    warn!(
                        error = &err as &dyn std::error::Error,
                        "load failed; transaction rolled back"
                    );
                    Err(err)
                }
            }
        }
        .instrument(span)
        .await
    }
}

async fn run_steps(
    conn: &mut PgConnection,
    batch: &Batch,
    target: &QualifiedTable,
    staging: &QualifiedTable,
) -> Result<LoadSummary, LoadError> {
    sqlx::query(&format!("DROP TABLE IF EXISTS {staging}"))
        .execute(&mut *conn)
        .await
        .map_err(LoadError::at(LoadStep::Stage))?;
    sqlx::query(&create_staging_sql(staging))
        .execute(&mut *conn)
        .await
        .map_err(LoadError::at(LoadStep::Stage))?;

    let columns = StagingColumns::from_batch(batch);
    let staged_rows = sqlx::query(&insert_staging_sql(staging))
        .bind(columns.ids)
        .bind(columns.names)
        .bind(columns.ages)
        .bind(columns.age_groups)
        .execute(&mut *conn)
        .await
        .map_err(LoadError::at(LoadStep::Stage))?
        .rows_affected();

    sqlx::query(&create_target_sql(target))
        .execute(&mut *conn)
        .await
        .map_err(LoadError::at(LoadStep::EnsureTarget))?;

    let upserted_rows = sqlx::query(&upsert_sql(target, staging))
        .execute(&mut *conn)
        .await
        .map_err(LoadError::at(LoadStep::Upsert))?
        .rows_affected();

    sqlx::query(&format!("DROP TABLE {staging}"))
        .execute(&mut *conn)
        .await
        .map_err(LoadError::at(LoadStep::DropStaging))?;

    Ok(LoadSummary {
        table: target.display_name(),
        staged_rows,
        upserted_rows,
    })
}

/// Column-major view of a batch, bound as one array per column.
struct StagingColumns {
    ids: Vec<i32>,
    names: Vec<Option<String>>,
    ages: Vec<i32>,
    age_groups: Vec<String>,
}

impl StagingColumns {
    fn from_batch(batch: &Batch) -> Self {
        let mut columns = Self {
            ids: Vec::with_capacity(batch.len()),
            names: Vec::with_capacity(batch.len()),
            ages: Vec::with_capacity(batch.len()),
            age_groups: Vec::with_capacity(batch.len()),
        };
        for record in batch {
            columns.ids.push(record.id());
            columns.names.push(record.name().map(str::to_string));
            columns.ages.push(record.age());
            columns.age_groups.push(record.age_group().to_string());
        }
        columns
    }
}

fn create_staging_sql(staging: &QualifiedTable) -> String {
    format!("CREATE TABLE {staging} (id INTEGER, name TEXT, age INTEGER, age_group TEXT)")
}

fn insert_staging_sql(staging: &QualifiedTable) -> String {
    format!(
        "INSERT INTO {staging} (id, name, age, age_group) \
         SELECT * FROM UNNEST($1::int4[], $2::text[], $3::int4[], $4::text[])"
    )
}

fn create_target_sql(target: &QualifiedTable) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {target} (\
         id INTEGER PRIMARY KEY, \
         name TEXT, \
         age INTEGER, \
         age_group TEXT)"
    )
}

fn upsert_sql(target: &QualifiedTable, staging: &QualifiedTable) -> String {
    format!(
        "INSERT INTO {target} (id, name, age, age_group) \
         SELECT id, name, age, age_group FROM {staging} \
         ON CONFLICT (id) DO UPDATE SET \
         name = EXCLUDED.name, \
         age = EXCLUDED.age, \
         age_group = EXCLUDED.age_group"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use cetl_core::Record;

    fn tables() -> (QualifiedTable, QualifiedTable) {
        let schema = Identifier::parse("public").unwrap();
        let table = TableName::parse("customers").unwrap();
        (table.qualified(&schema), table.staging_in(&schema))
    }

    #[test]
    fn upsert_statement_targets_quoted_tables() {
        let (target, staging) = tables();
        let sql = upsert_sql(&target, &staging);
        assert!(sql.starts_with("INSERT INTO \"public\".\"customers\" (id, name, age, age_group)"));
        assert!(sql.contains("FROM \"public\".\"customers_temp\""));
        assert!(sql.contains("ON CONFLICT (id) DO UPDATE SET"));
        assert!(sql.contains("age_group = EXCLUDED.age_group"));
        assert!(!sql.contains("DELETE"));
    }

    #[test]
    fn target_schema_is_fixed() {
        let (target, _) = tables();
        assert_eq!(
            create_target_sql(&target),
            "CREATE TABLE IF NOT EXISTS \"public\".\"customers\" \
             (id INTEGER PRIMARY KEY, name TEXT, age INTEGER, age_group TEXT)"
        );
    }

    #[test]
    fn staging_columns_are_column_major_and_ordered() {
        let batch = Batch::new(vec![
            Record::new(2, Some("Bob".into()), 45),
            Record::new(1, None, 28),
        ]);
        let columns = StagingColumns::from_batch(&batch);
        assert_eq!(columns.ids, vec![2, 1]);
        assert_eq!(columns.names, vec![Some("Bob".to_string()), None]);
        assert_eq!(columns.ages, vec![45, 28]);
        assert_eq!(columns.age_groups, vec!["Senior".to_string(), "Youth".to_string()]);
    }

    #[test]
    fn load_errors_name_the_failed_step() {
        let err = LoadError::at(LoadStep::Upsert)(sqlx::Error::PoolTimedOut);
        assert_eq!(err.step(), Some(LoadStep::Upsert));
        assert_eq!(err.to_string(), "upsert from staging failed");
        assert!(std::error::Error::source(&err).is_some());
        assert_eq!(LoadError::Connect(sqlx::Error::PoolClosed).step(), None);
    }
}
