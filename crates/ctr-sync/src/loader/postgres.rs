use async_trait::async_trait;
use sqlx::postgres::{PgConnection, PgPoolOptions};
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{debug, info, warn};

use super::merge::{quote_ident, MergePlan};
use super::{ensure_known_table, loadable_columns, open_transaction, staging_name, LoadError, Loader};
use crate::staging::LoadBatch;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS eu_trials (
        eudract_number VARCHAR(20) PRIMARY KEY,
        sponsor_name VARCHAR(500),
        trial_title TEXT,
        start_date DATE,
        trial_status VARCHAR(50),
        age_groups TEXT[],
        url_source TEXT,
        last_updated TIMESTAMPTZ DEFAULT now()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS eu_trial_drugs (
        id SERIAL PRIMARY KEY,
        eudract_number VARCHAR(20) REFERENCES eu_trials (eudract_number) ON DELETE CASCADE,
        drug_name VARCHAR(255),
        active_ingredient VARCHAR(255),
        pharmaceutical_form VARCHAR(255),
        cas_number VARCHAR(50)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS eu_trial_conditions (
        id SERIAL PRIMARY KEY,
        eudract_number VARCHAR(20) REFERENCES eu_trials (eudract_number) ON DELETE CASCADE,
        condition_name TEXT,
        meddra_code VARCHAR(50)
    )
    "#,
];

/// Postgres backend: one connection, one transaction, `COPY FROM STDIN` as the fast path.
pub struct PostgresLoader {
    database_url: String,
    pool: Option<PgPool>,
    tx: Option<Transaction<'static, Postgres>>,
}

impl PostgresLoader {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            pool: None,
            tx: None,
        }
    }

    /// Deliver through an existing pool; `connect` becomes a no-op.
    pub fn with_pool(pool: PgPool) -> Self {
        Self {
            database_url: String::new(),
            pool: Some(pool),
            tx: None,
        }
    }

    async fn transaction(&mut self) -> Result<&mut Transaction<'static, Postgres>, LoadError> {
        open_transaction(self.pool.as_ref(), &mut self.tx).await
    }
}

async fn relation_columns(conn: &mut PgConnection, relation: &str) -> Result<Vec<String>, LoadError> {
    let columns = sqlx::query_scalar::<_, String>(
        r#"
        SELECT attname::text
          FROM pg_attribute
         WHERE attrelid = $1::regclass
           AND attnum > 0
           AND NOT attisdropped
         ORDER BY attnum
        "#,
    )
    .bind(quote_ident(relation))
    .fetch_all(conn)
    .await?;
    Ok(columns)
}

async fn copy_csv(conn: &mut PgConnection, relation: &str, batch: &LoadBatch) -> Result<u64, LoadError> {
    let body = batch.to_csv()?;
    let columns = batch
        .columns()
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    let statement = format!(
        "COPY {} ({columns}) FROM STDIN (FORMAT csv, HEADER true)",
        quote_ident(relation)
    );

    let mut copy = conn.copy_in_raw(&statement).await?;
    let sent = copy.send(body).await.map(|_| ());
    if let Err(err) = sent {
        if let Err(abort_err) = copy.abort(err.to_string()).await {
            warn!(relation, error = %abort_err, "aborting COPY failed");
        }
        return Err(err.into());
    }
    Ok(copy.finish().await?)
}

async fn merge_staged(
    conn: &mut PgConnection,
    table: &str,
    staging: &str,
    batch: &LoadBatch,
    conflict_keys: &[&str],
) -> Result<u64, LoadError> {
    let staging_columns = relation_columns(&mut *conn, staging).await?;
    let plan = MergePlan::new(table, staging, batch.columns(), &staging_columns, conflict_keys)?;
    copy_csv(&mut *conn, staging, &batch.project(plan.columns())).await?;
    let merged = sqlx::query(&plan.postgres_merge_sql())
        .execute(&mut *conn)
        .await?
        .rows_affected();
    Ok(merged)
}

#[async_trait]
impl Loader for PostgresLoader {
    async fn connect(&mut self) -> Result<(), LoadError> {
        if self.pool.is_some() {
            return Ok(());
        }
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .connect(&self.database_url)
            .await?;
        info!("connected to postgres");
        self.pool = Some(pool);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), LoadError> {
        if let Some(tx) = self.tx.take() {
            warn!("closing with an open transaction; rolling back");
            tx.rollback().await?;
        }
        if let Some(pool) = self.pool.take() {
            pool.close().await;
            debug!("postgres connection closed");
        }
        Ok(())
    }

    async fn prepare_schema(&mut self) -> Result<(), LoadError> {
        let tx = self.transaction().await?;
        for statement in SCHEMA {
            sqlx::query(statement).execute(&mut **tx).await?;
        }
        debug!("postgres schema ensured");
        Ok(())
    }

    async fn bulk_load(&mut self, table: &str, batch: &LoadBatch) -> Result<(), LoadError> {
        ensure_known_table(table)?;
        if batch.is_empty() {
            debug!(table, "empty batch; nothing to load");
            return Ok(());
        }
        let tx = self.transaction().await?;
        let available = relation_columns(&mut **tx, table).await?;
        let projected = batch.project(&loadable_columns(batch, &available));
        let copied = copy_csv(&mut **tx, table, &projected).await?;
        info!(table, rows = copied, "bulk loaded");
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
            debug!(table, "empty batch; nothing to merge");
            return Ok(());
        }
        let staging = staging_name(table);
        let tx = self.transaction().await?;
        sqlx::query(&format!(
            "CREATE TEMP TABLE {} (LIKE {} INCLUDING DEFAULTS) ON COMMIT DROP",
            quote_ident(&staging),
            quote_ident(table)
        ))
        .execute(&mut **tx)
        .await?;

        let merged = merge_staged(&mut **tx, table, &staging, batch, conflict_keys).await;
        let dropped = sqlx::query(&format!("DROP TABLE IF EXISTS {}", quote_ident(&staging)))
            .execute(&mut **tx)
            .await;

        let merged = merged?;
        if let Err(err) = dropped {
            return Err(err.into());
        }
        info!(table, staged = batch.len(), merged, "upserted");
        Ok(())
    }

    async fn truncate(&mut self, tables: &[&str]) -> Result<(), LoadError> {
        if tables.is_empty() {
            return Ok(());
        }
        for table in tables {
            ensure_known_table(table)?;
        }
        let list = tables
            .iter()
            .map(|t| quote_ident(t))
            .collect::<Vec<_>>()
            .join(", ");
        let tx = self.transaction().await?;
        sqlx::query(&format!("TRUNCATE TABLE {list}"))
            .execute(&mut **tx)
            .await?;
        info!(?tables, "truncated");
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), LoadError> {
        if self.pool.is_none() {
            return Err(LoadError::NotConnected);
        }
        if let Some(tx) = self.tx.take() {
            tx.commit().await?;
            info!("postgres transaction committed");
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), LoadError> {
        if let Some(tx) = self.tx.take() {
            tx.rollback().await?;
            warn!("postgres transaction rolled back");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::conflict_keys;
    use ctr_core::{Cell, CONDITIONS_TABLE, DRUGS_TABLE, TRIALS_TABLE};

    fn text(value: &str) -> Cell {
        Cell::Text(value.to_string())
    }

    fn batch(table: &str, columns: &[&str], rows: Vec<Vec<Cell>>) -> LoadBatch {
        let mut batch = LoadBatch::new(table, columns.iter().map(|c| c.to_string()).collect());
        batch.extend(rows);
        batch
    }

    fn sponsors(rows: &[(&str, &str)]) -> LoadBatch {
        batch(
            TRIALS_TABLE,
            &["eudract_number", "sponsor_name"],
            rows.iter().map(|(id, sponsor)| vec![text(id), text(sponsor)]).collect(),
        )
    }

    async fn upsert_and_commit(pool: &PgPool, table: &str, batch: &LoadBatch) -> Result<(), LoadError> {
        let mut loader = PostgresLoader::with_pool(pool.clone());
        loader.prepare_schema().await?;
        loader.upsert(table, batch, conflict_keys(table)).await?;
        loader.commit().await
    }

    async fn trial_sponsors(pool: &PgPool) -> Result<Vec<(String, Option<String>)>, LoadError> {
        Ok(sqlx::query_as::<_, (String, Option<String>)>(
            "SELECT eudract_number, sponsor_name FROM eu_trials ORDER BY eudract_number",
        )
        .fetch_all(pool)
        .await?)
    }

    async fn count(pool: &PgPool, table: &str) -> Result<i64, LoadError> {
        Ok(sqlx::query_scalar::<_, i64>(&format!("SELECT COUNT(*) FROM {}", quote_ident(table)))
            .fetch_one(pool)
            .await?)
    }

    #[test]
    fn schema_creates_every_target_idempotently() {
        for table in [TRIALS_TABLE, DRUGS_TABLE, CONDITIONS_TABLE] {
            assert!(SCHEMA
                .iter()
                .any(|ddl| ddl.contains(&format!("CREATE TABLE IF NOT EXISTS {table} ("))));
        }
        assert!(SCHEMA[0].contains("age_groups TEXT[]"));
    }

    #[tokio::test]
    async fn writes_before_connect_are_refused() {
        let mut loader = PostgresLoader::new("postgres://localhost/none");
        let mut one = LoadBatch::new(TRIALS_TABLE, vec!["eudract_number".into()]);
        one.extend(vec![vec![ctr_core::Cell::Text("2004-000001-11".into())]]);
        assert!(matches!(
            loader.bulk_load(TRIALS_TABLE, &one).await,
            Err(LoadError::NotConnected)
        ));
        assert!(matches!(loader.commit().await, Err(LoadError::NotConnected)));
        assert!(loader.rollback().await.is_ok());
        assert!(loader.close().await.is_ok());
    }

    #[sqlx::test(migrations = false)]
    async fn upsert_replaces_non_key_columns(pool: PgPool) -> Result<(), LoadError> {
        upsert_and_commit(&pool, TRIALS_TABLE, &sponsors(&[("X", "Old")])).await?;
        upsert_and_commit(&pool, TRIALS_TABLE, &sponsors(&[("X", "New")])).await?;

        assert_eq!(
            trial_sponsors(&pool).await?,
            vec![("X".to_string(), Some("New".to_string()))]
        );
        Ok(())
    }

    #[sqlx::test(migrations = false)]
    async fn duplicate_keys_in_one_batch_collapse_to_the_last_row(pool: PgPool) -> Result<(), LoadError> {
        upsert_and_commit(&pool, TRIALS_TABLE, &sponsors(&[("Y", "A"), ("Y", "B")])).await?;

        assert_eq!(
            trial_sponsors(&pool).await?,
            vec![("Y".to_string(), Some("B".to_string()))]
        );
        Ok(())
    }

    #[sqlx::test(migrations = false)]
    async fn repeating_an_upsert_changes_nothing(pool: PgPool) -> Result<(), LoadError> {
        let trials = sponsors(&[("Z", "Sponsor")]);
        let drugs = batch(
            DRUGS_TABLE,
            &["eudract_number", "drug_name", "pharmaceutical_form", "active_ingredient"],
            vec![vec![text("Z"), text("Drug"), Cell::Null, text("ingredient")]],
        );
        let conditions = batch(
            CONDITIONS_TABLE,
            &["eudract_number", "condition_name"],
            vec![vec![text("Z"), text("Asthma")]],
        );

        for _ in 0..2 {
            upsert_and_commit(&pool, TRIALS_TABLE, &trials).await?;
            upsert_and_commit(&pool, DRUGS_TABLE, &drugs).await?;
            upsert_and_commit(&pool, CONDITIONS_TABLE, &conditions).await?;
        }

        assert_eq!(count(&pool, TRIALS_TABLE).await?, 1);
        assert_eq!(count(&pool, DRUGS_TABLE).await?, 1);
        assert_eq!(count(&pool, CONDITIONS_TABLE).await?, 1);
        assert_eq!(
            trial_sponsors(&pool).await?,
            vec![("Z".to_string(), Some("Sponsor".to_string()))]
        );
        Ok(())
    }

    #[sqlx::test(migrations = false)]
    async fn failed_upsert_rolls_back_to_committed_rows(pool: PgPool) -> Result<(), LoadError> {
        upsert_and_commit(&pool, TRIALS_TABLE, &sponsors(&[("X", "Kept")])).await?;

        let bad = batch(
            TRIALS_TABLE,
            &["eudract_number", "sponsor_name", "start_date"],
            vec![vec![text("X"), text("Lost"), text("not-a-date")]],
        );
        let mut loader = PostgresLoader::with_pool(pool.clone());
        assert!(loader.upsert(TRIALS_TABLE, &bad, conflict_keys(TRIALS_TABLE)).await.is_err());
        loader.rollback().await?;

        assert_eq!(
            trial_sponsors(&pool).await?,
            vec![("X".to_string(), Some("Kept".to_string()))]
        );
        Ok(())
    }

    #[sqlx::test(migrations = false)]
    async fn bulk_load_copies_quoted_text_and_arrays(pool: PgPool) -> Result<(), LoadError> {
        let trials = batch(
            TRIALS_TABLE,
            &["eudract_number", "sponsor_name", "age_groups"],
            vec![vec![
                text("2004-000015-25"),
                text("S, \"quoted\"\nline"),
                Cell::List(vec!["Adults".to_string(), "Elderly \"65+\"".to_string()]),
            ]],
        );
        let mut loader = PostgresLoader::with_pool(pool.clone());
        loader.prepare_schema().await?;
        loader.truncate(crate::loader::TRUNCATE_ORDER).await?;
        loader.bulk_load(TRIALS_TABLE, &trials).await?;
        loader.commit().await?;

        let (sponsor, ages): (String, Vec<String>) =
            sqlx::query_as("SELECT sponsor_name, age_groups FROM eu_trials")
                .fetch_one(&pool)
                .await?;
        assert_eq!(sponsor, "S, \"quoted\"\nline");
        assert_eq!(ages, vec!["Adults".to_string(), "Elderly \"65+\"".to_string()]);
        Ok(())
    }
}
