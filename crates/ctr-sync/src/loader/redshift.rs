//! Redshift backend: CSV staged in S3, loaded with `COPY ... IAM_ROLE`.

use async_trait::async_trait;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use ctr_storage::content::build_s3_client;
use ctr_storage::S3Location;
use sqlx::postgres::{PgConnection, PgPoolOptions};
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::merge::{quote_ident, quote_literal, MergePlan};
use super::{ensure_known_table, loadable_columns, open_transaction, staging_name, LoadError, Loader};
use crate::staging::LoadBatch;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS eu_trials (
        eudract_number VARCHAR(20) NOT NULL PRIMARY KEY,
        sponsor_name VARCHAR(500),
        trial_title VARCHAR(65535),
        start_date DATE,
        trial_status VARCHAR(50),
        age_groups VARCHAR(65535),
        url_source VARCHAR(65535),
        last_updated TIMESTAMP DEFAULT GETDATE()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS eu_trial_drugs (
        id INT IDENTITY(1, 1),
        eudract_number VARCHAR(20) REFERENCES eu_trials (eudract_number),
        drug_name VARCHAR(255),
        active_ingredient VARCHAR(255),
        pharmaceutical_form VARCHAR(255),
        cas_number VARCHAR(50)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS eu_trial_conditions (
        id INT IDENTITY(1, 1),
        eudract_number VARCHAR(20) REFERENCES eu_trials (eudract_number),
        condition_name VARCHAR(65535),
        meddra_code VARCHAR(50)
    )
    "#,
];

/// Where staged CSV objects go and how Redshift is allowed to read them.
#[derive(Debug, Clone)]
pub struct RedshiftStaging {
    pub location: S3Location,
    pub iam_role: String,
}

impl RedshiftStaging {
    pub fn object_key(&self) -> String {
        self.location.full_key(&format!("{}.csv", Uuid::new_v4()))
    }

    /// `COPY` from one staged object into `relation`, columns in batch header order.
    pub fn copy_sql(&self, relation: &str, columns: &[String], key: &str) -> String {
        let columns = columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        let uri = format!("s3://{}/{key}", self.location.bucket);
        let mut sql = format!(
            "COPY {} ({columns}) FROM {} IAM_ROLE {} FORMAT AS CSV IGNOREHEADER 1 EMPTYASNULL DATEFORMAT 'auto' TIMEFORMAT 'auto'",
            quote_ident(relation),
            quote_literal(&uri),
            quote_literal(&self.iam_role),
        );
        if let Some(region) = &self.location.region {
            sql.push_str(&format!(" REGION {}", quote_literal(region)));
        }
        sql
    }
}

pub struct RedshiftLoader {
    database_url: String,
    staging: RedshiftStaging,
    pool: Option<PgPool>,
    s3: Option<Client>,
    tx: Option<Transaction<'static, Postgres>>,
}

impl RedshiftLoader {
    pub fn new(
        database_url: impl Into<String>,
        iam_role: impl Into<String>,
        location: S3Location,
    ) -> Result<Self, LoadError> {
        let iam_role = iam_role.into();
        if iam_role.trim().is_empty() {
            return Err(LoadError::Invalid(
                "redshift loads need an IAM role for COPY".to_string(),
            ));
        }
        if location.bucket.trim().is_empty() {
            return Err(LoadError::Invalid(
                "redshift loads need an S3 bucket for staging".to_string(),
            ));
        }
        Ok(Self {
            database_url: database_url.into(),
            staging: RedshiftStaging { location, iam_role },
            pool: None,
            s3: None,
            tx: None,
        })
    }
}

/// Table columns from the catalog; staging relations share their target's shape.
async fn table_columns(conn: &mut PgConnection, table: &str) -> Result<Vec<String>, LoadError> {
    let columns = sqlx::query_scalar::<_, String>(
        r#"
        SELECT column_name::varchar
          FROM information_schema.columns
         WHERE table_name = $1
         ORDER BY ordinal_position
        "#,
    )
    .bind(table)
    .fetch_all(conn)
    .await?;
    Ok(columns)
}

/// Upload, `COPY`, then delete the staged object whatever the outcome.
async fn copy_via_s3(
    conn: &mut PgConnection,
    s3: &Client,
    staging: &RedshiftStaging,
    relation: &str,
    batch: &LoadBatch,
) -> Result<(), LoadError> {
    let body = batch.to_csv()?;
    let key = staging.object_key();
    let bucket = &staging.location.bucket;
    s3.put_object()
        .bucket(bucket)
        .key(&key)
        .content_type("text/csv")
        .body(ByteStream::from(body))
        .send()
        .await
        .map_err(|e| {
            LoadError::ObjectStorage(format!(
                "uploading s3://{bucket}/{key}: {}",
                DisplayErrorContext(e)
            ))
        })?;
    debug!(relation, %key, rows = batch.len(), "staged batch in S3");

    let copied = sqlx::query(&staging.copy_sql(relation, batch.columns(), &key))
        .execute(&mut *conn)
        .await;

    if let Err(err) = s3.delete_object().bucket(bucket).key(&key).send().await {
        warn!(%key, error = %DisplayErrorContext(err), "failed to delete staged object");
    }
    copied?;
    Ok(())
}

async fn merge_staged(
    conn: &mut PgConnection,
    s3: &Client,
    staging: &RedshiftStaging,
    table: &str,
    staging_table: &str,
    batch: &LoadBatch,
    conflict_keys: &[&str],
) -> Result<(), LoadError> {
    let columns = table_columns(&mut *conn, table).await?;
    let plan = MergePlan::new(table, staging_table, batch.columns(), &columns, conflict_keys)?;
    copy_via_s3(&mut *conn, s3, staging, staging_table, &batch.project(plan.columns())).await?;
    if let Some(delete) = plan.delete_matching_sql() {
        sqlx::query(&delete).execute(&mut *conn).await?;
    }
    sqlx::query(&plan.insert_deduplicated_sql())
        .execute(&mut *conn)
        .await?;
    Ok(())
}

#[async_trait]
impl Loader for RedshiftLoader {
    async fn connect(&mut self) -> Result<(), LoadError> {
        if self.pool.is_some() {
            return Ok(());
        }
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .connect(&self.database_url)
            .await?;
        self.s3 = Some(build_s3_client(&self.staging.location).await);
        self.pool = Some(pool);
        info!(bucket = %self.staging.location.bucket, "connected to redshift");
        Ok(())
    }

    async fn close(&mut self) -> Result<(), LoadError> {
        if let Some(tx) = self.tx.take() {
            warn!("closing with an open transaction; rolling back");
            tx.rollback().await?;
        }
        if let Some(pool) = self.pool.take() {
            pool.close().await;
        }
        self.s3 = None;
        Ok(())
    }

    async fn prepare_schema(&mut self) -> Result<(), LoadError> {
        let tx = open_transaction(self.pool.as_ref(), &mut self.tx).await?;
        for statement in SCHEMA {
            sqlx::query(statement).execute(&mut **tx).await?;
        }
        debug!("redshift schema ensured");
        Ok(())
    }

    async fn bulk_load(&mut self, table: &str, batch: &LoadBatch) -> Result<(), LoadError> {
        ensure_known_table(table)?;
        if batch.is_empty() {
            return Ok(());
        }
        let s3 = self.s3.as_ref().ok_or(LoadError::NotConnected)?;
        let tx = open_transaction(self.pool.as_ref(), &mut self.tx).await?;
        let available = table_columns(&mut **tx, table).await?;
        let projected = batch.project(&loadable_columns(batch, &available));
        copy_via_s3(&mut **tx, s3, &self.staging, table, &projected).await?;
        info!(table, rows = projected.len(), "bulk loaded");
        Ok(())
    }

    async fn upsert(
        &mut self,
        table: &str,
        batch: &LoadBatch,
        conflict_keys: &[&str],
    ) -> Result<(), LoadError> {
        ensure_known_table(table)?;
        if batch.is_empty() {
            return Ok(());
        }
        let s3 = self.s3.as_ref().ok_or(LoadError::NotConnected)?;
        let tx = open_transaction(self.pool.as_ref(), &mut self.tx).await?;
        let staging_table = staging_name(table);
        sqlx::query(&format!(
            "CREATE TEMP TABLE {} (LIKE {})",
            quote_ident(&staging_table),
            quote_ident(table)
        ))
        .execute(&mut **tx)
        .await?;

        let merged = merge_staged(
            &mut **tx,
            s3,
            &self.staging,
            table,
            &staging_table,
            batch,
            conflict_keys,
        )
        .await;
        let dropped = sqlx::query(&format!("DROP TABLE IF EXISTS {}", quote_ident(&staging_table)))
            .execute(&mut **tx)
            .await;

        merged?;
        if let Err(err) = dropped {
            return Err(err.into());
        }
        info!(table, staged = batch.len(), "upserted");
        Ok(())
    }

    async fn truncate(&mut self, tables: &[&str]) -> Result<(), LoadError> {
        for table in tables {
            ensure_known_table(table)?;
        }
        let tx = open_transaction(self.pool.as_ref(), &mut self.tx).await?;
        for table in tables {
            sqlx::query(&format!("DELETE FROM {}", quote_ident(table)))
                .execute(&mut **tx)
                .await?;
        }
        info!(?tables, "cleared");
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), LoadError> {
        if self.pool.is_none() {
            return Err(LoadError::NotConnected);
        }
        if let Some(tx) = self.tx.take() {
            tx.commit().await?;
            info!("redshift transaction committed");
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), LoadError> {
        if let Some(tx) = self.tx.take() {
            tx.rollback().await?;
            warn!("redshift transaction rolled back");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn location() -> S3Location {
        S3Location {
            bucket: "warehouse-staging".into(),
            prefix: "euctr/_staging".into(),
            region: Some("eu-west-1".into()),
            endpoint: None,
        }
    }

    #[test]
    fn iam_role_and_bucket_are_required() {
        assert!(matches!(
            RedshiftLoader::new("postgres://rs", " ", location()),
            Err(LoadError::Invalid(_))
        ));
        assert!(matches!(
            RedshiftLoader::new("postgres://rs", "arn:aws:iam::1:role/x", S3Location::default()),
            Err(LoadError::Invalid(_))
        ));
        assert!(RedshiftLoader::new("postgres://rs", "arn:aws:iam::1:role/x", location()).is_ok());
    }

    #[test]
    fn copy_statement_quotes_role_and_uri() {
        let staging = RedshiftStaging {
            location: location(),
            iam_role: "arn:aws:iam::1:role/o'brien".into(),
        };
        let key = staging.object_key();
        assert!(key.starts_with("euctr/_staging/"));
        assert!(key.ends_with(".csv"));

        let sql = staging.copy_sql(
            "eu_trials",
            &["eudract_number".to_string(), "sponsor_name".to_string()],
            "euctr/_staging/abc.csv",
        );
        assert_eq!(
            sql,
            "COPY \"eu_trials\" (\"eudract_number\", \"sponsor_name\") FROM 's3://warehouse-staging/euctr/_staging/abc.csv' \
             IAM_ROLE 'arn:aws:iam::1:role/o''brien' FORMAT AS CSV IGNOREHEADER 1 EMPTYASNULL DATEFORMAT 'auto' TIMEFORMAT 'auto' REGION 'eu-west-1'"
        );
    }

    #[test]
    fn schema_keeps_list_columns_as_text() {
        assert!(SCHEMA[0].contains("age_groups VARCHAR(65535)"));
        assert!(SCHEMA[1].contains("IDENTITY(1, 1)"));
    }

    #[tokio::test]
    async fn writes_before_connect_are_refused() {
        let mut loader =
            RedshiftLoader::new("postgres://rs", "arn:aws:iam::1:role/x", location()).expect("loader");
        let mut batch = LoadBatch::new(ctr_core::TRIALS_TABLE, vec!["eudract_number".into()]);
        batch.extend(vec![vec![ctr_core::Cell::Text("2004-000001-11".into())]]);
        assert!(matches!(
            loader.upsert(ctr_core::TRIALS_TABLE, &batch, &["eudract_number"]).await,
            Err(LoadError::NotConnected)
        ));
        assert!(matches!(loader.truncate(&[]).await, Err(LoadError::NotConnected)));
    }
}
