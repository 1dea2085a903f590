//! Warehouse delivery contract and its backends.

pub mod bigquery;
pub mod merge;
pub mod postgres;
pub mod redshift;

use async_trait::async_trait;
use ctr_core::{CONDITIONS_TABLE, DRUGS_TABLE, TRIALS_TABLE};
use sqlx::{PgPool, Postgres, Transaction};
use thiserror::Error;
use tracing::{debug, warn};

use crate::staging::LoadBatch;

pub use bigquery::{BigQueryLoader, BigQueryTarget, TokenSource};
pub use merge::{quote_ident, MergePlan};
pub use postgres::PostgresLoader;
pub use redshift::RedshiftLoader;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("loader is not connected")]
    NotConnected,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("warehouse api error: {0}")]
    Warehouse(String),
    #[error("object storage error: {0}")]
    ObjectStorage(String),
    #[error("encoding batch: {0}")]
    Encode(#[from] csv::Error),
    #[error("invalid load request: {0}")]
    Invalid(String),
}

/// Bulk and upsert delivery to one warehouse.
///
/// Writes between `connect` and `commit`/`rollback` belong to one transaction.
#[async_trait]
pub trait Loader: Send {
    async fn connect(&mut self) -> Result<(), LoadError>;

    async fn close(&mut self) -> Result<(), LoadError>;

    /// Idempotent DDL for the three target tables.
    async fn prepare_schema(&mut self) -> Result<(), LoadError>;

    /// Append every row of `batch` to `table`.
    async fn bulk_load(&mut self, table: &str, batch: &LoadBatch) -> Result<(), LoadError>;

    /// Stage `batch`, then merge it into `table` matching on `conflict_keys`.
    async fn upsert(
        &mut self,
        table: &str,
        batch: &LoadBatch,
        conflict_keys: &[&str],
    ) -> Result<(), LoadError>;

    async fn truncate(&mut self, tables: &[&str]) -> Result<(), LoadError>;

    async fn commit(&mut self) -> Result<(), LoadError>;

    async fn rollback(&mut self) -> Result<(), LoadError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadMode {
    /// Truncate all targets, then append.
    #[default]
    Full,
    /// Merge on each table's natural key.
    Upsert,
}

/// Child tables first so truncation satisfies foreign keys.
pub const TRUNCATE_ORDER: &[&str] = &[CONDITIONS_TABLE, DRUGS_TABLE, TRIALS_TABLE];

pub fn conflict_keys(table: &str) -> &'static [&'static str] {
    match table {
        TRIALS_TABLE => &["eudract_number"],
        DRUGS_TABLE => &["eudract_number", "drug_name", "pharmaceutical_form"],
        CONDITIONS_TABLE => &["eudract_number", "condition_name"],
        _ => &[],
    }
}

/// Reject table names that are not one of the managed targets.
pub(crate) fn ensure_known_table(table: &str) -> Result<(), LoadError> {
    if [TRIALS_TABLE, DRUGS_TABLE, CONDITIONS_TABLE].contains(&table) {
        Ok(())
    } else {
        Err(LoadError::Invalid(format!("unknown target table {table}")))
    }
}

/// The open transaction, begun on first use.
pub(crate) async fn open_transaction<'a>(
    pool: Option<&PgPool>,
    tx: &'a mut Option<Transaction<'static, Postgres>>,
) -> Result<&'a mut Transaction<'static, Postgres>, LoadError> {
    if tx.is_none() {
        let pool = pool.ok_or(LoadError::NotConnected)?;
        *tx = Some(pool.begin().await?);
        debug!("transaction opened");
    }
    tx.as_mut().ok_or(LoadError::NotConnected)
}

/// Batch header columns the relation actually has, in header order.
pub(crate) fn loadable_columns(batch: &LoadBatch, available: &[String]) -> Vec<String> {
    let (kept, dropped): (Vec<String>, Vec<String>) = batch
        .columns()
        .iter()
        .cloned()
        .partition(|c| available.contains(c));
    if !dropped.is_empty() {
        warn!(table = batch.table(), ?dropped, "batch columns missing from target; skipped");
    }
    kept
}

/// Short random suffix for per-call staging relations.
pub(crate) fn staging_name(table: &str) -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("{table}_staging_{}", &id[..8])
}
