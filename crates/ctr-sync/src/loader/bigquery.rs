//! BigQuery backend: CSV staged in Cloud Storage, load jobs, then `MERGE`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, RequestBuilder, Response, Url};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::merge::{quote_bigquery, MergePlan};
use super::{ensure_known_table, loadable_columns, staging_name, LoadError, Loader};
use crate::staging::LoadBatch;

pub const BIGQUERY_API: &str = "https://bigquery.googleapis.com/bigquery/v2";
pub const STORAGE_API: &str = "https://storage.googleapis.com";
const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";

// Child tables carry no surrogate id; age groups stay in their array-literal text form.
const SCHEMA: &[(&str, &str, &str)] = &[
    (
        "eu_trials",
        "eudract_number STRING NOT NULL, sponsor_name STRING, trial_title STRING, start_date DATE, \
         trial_status STRING, age_groups STRING, url_source STRING, \
         last_updated TIMESTAMP DEFAULT CURRENT_TIMESTAMP()",
        " CLUSTER BY eudract_number",
    ),
    (
        "eu_trial_drugs",
        "eudract_number STRING NOT NULL, drug_name STRING, active_ingredient STRING, \
         pharmaceutical_form STRING, cas_number STRING",
        "",
    ),
    (
        "eu_trial_conditions",
        "eudract_number STRING NOT NULL, condition_name STRING, meddra_code STRING",
        "",
    ),
];

/// Dataset and Cloud Storage staging area for BigQuery loads.
#[derive(Debug, Clone)]
pub struct BigQueryTarget {
    /// Taken from the credentials when absent.
    pub project_id: Option<String>,
    pub dataset_id: String,
    pub location: String,
    pub gcs_bucket: String,
    pub gcs_prefix: String,
}

impl Default for BigQueryTarget {
    fn default() -> Self {
        Self {
            project_id: None,
            dataset_id: "eu_ctr".to_string(),
            location: "US".to_string(),
            gcs_bucket: String::new(),
            gcs_prefix: String::new(),
        }
    }
}

impl BigQueryTarget {
    pub fn object_name(&self) -> String {
        let file = format!("{}.csv", Uuid::new_v4());
        match self.gcs_prefix.trim_matches('/') {
            "" => file,
            prefix => format!("{prefix}/{file}"),
        }
    }
}

/// OAuth access for the Google APIs.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn access_token(&self) -> Result<String, LoadError>;

    async fn project_id(&self) -> Result<String, LoadError>;
}

/// Application default credentials.
struct DefaultCredentials(Arc<dyn gcp_auth::TokenProvider>);

#[async_trait]
impl TokenSource for DefaultCredentials {
    async fn access_token(&self) -> Result<String, LoadError> {
        let token = self
            .0
            .token(&[CLOUD_PLATFORM_SCOPE])
            .await
            .map_err(|e| LoadError::Warehouse(format!("fetching access token: {e}")))?;
        Ok(token.as_str().to_string())
    }

    async fn project_id(&self) -> Result<String, LoadError> {
        let id = self
            .0
            .project_id()
            .await
            .map_err(|e| LoadError::Warehouse(format!("resolving project id: {e}")))?;
        Ok(id.to_string())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Job {
    job_reference: JobReference,
    status: JobStatus,
    #[serde(default)]
    statistics: Option<JobStatistics>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobReference {
    job_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobStatus {
    state: String,
    #[serde(default)]
    error_result: Option<JobError>,
}

#[derive(Debug, Deserialize)]
struct JobError {
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JobStatistics {
    #[serde(default)]
    load: Option<LoadStatistics>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoadStatistics {
    #[serde(default)]
    output_rows: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TableResource {
    #[serde(default)]
    schema: Option<TableSchema>,
}

#[derive(Debug, Deserialize)]
struct TableSchema {
    #[serde(default)]
    fields: Vec<TableField>,
}

#[derive(Debug, Deserialize)]
struct TableField {
    name: String,
}

fn api_error(err: reqwest::Error) -> LoadError {
    LoadError::Warehouse(err.to_string())
}

/// Authenticated client state, present between `connect` and `close`.
struct Session {
    http: Client,
    tokens: Arc<dyn TokenSource>,
    project_id: String,
    bigquery_api: String,
    storage_api: String,
    target: BigQueryTarget,
    poll_interval: Duration,
}

impl Session {
    fn table_path(&self, table: &str) -> String {
        quote_bigquery(&format!("{}.{}.{table}", self.project_id, self.target.dataset_id))
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, LoadError> {
        let token = self.tokens.access_token().await?;
        let response = request.bearer_auth(token).send().await.map_err(api_error)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(LoadError::Warehouse(format!("{status}: {}", body.trim())))
    }

    /// Insert a job and poll until it is done.
    async fn run_job(&self, configuration: Value) -> Result<Job, LoadError> {
        let jobs_url = format!("{}/projects/{}/jobs", self.bigquery_api, self.project_id);
        let body = json!({
            "jobReference": {
                "projectId": self.project_id,
                "jobId": format!("ctr_{}", Uuid::new_v4().simple()),
                "location": self.target.location,
            },
            "configuration": configuration,
        });
        let mut job: Job = self
            .send(self.http.post(&jobs_url).json(&body))
            .await?
            .json()
            .await
            .map_err(api_error)?;

        while job.status.state != "DONE" {
            tokio::time::sleep(self.poll_interval).await;
            let url = format!("{jobs_url}/{}", job.job_reference.job_id);
            job = self
                .send(self.http.get(&url).query(&[("location", &self.target.location)]))
                .await?
                .json()
                .await
                .map_err(api_error)?;
        }

        if let Some(error) = &job.status.error_result {
            return Err(LoadError::Warehouse(format!(
                "job {} failed ({}): {}",
                job.job_reference.job_id,
                error.reason.as_deref().unwrap_or("unknown"),
                error.message.as_deref().unwrap_or("no message"),
            )));
        }
        Ok(job)
    }

    async fn query(&self, sql: &str) -> Result<(), LoadError> {
        debug!(sql, "running bigquery statement");
        self.run_job(json!({ "query": { "query": sql, "useLegacySql": false } }))
            .await?;
        Ok(())
    }

    async fn table_columns(&self, table: &str) -> Result<Vec<String>, LoadError> {
        let url = format!(
            "{}/projects/{}/datasets/{}/tables/{table}",
            self.bigquery_api, self.project_id, self.target.dataset_id
        );
        let resource: TableResource = self
            .send(self.http.get(&url))
            .await?
            .json()
            .await
            .map_err(api_error)?;
        let columns: Vec<String> = resource
            .schema
            .map(|s| s.fields.into_iter().map(|f| f.name).collect())
            .unwrap_or_default();
        if columns.is_empty() {
            return Err(LoadError::Invalid(format!("{table} has no columns in bigquery")));
        }
        Ok(columns)
    }

    async fn upload(&self, name: &str, body: Vec<u8>) -> Result<(), LoadError> {
        let url = format!("{}/upload/storage/v1/b/{}/o", self.storage_api, self.target.gcs_bucket);
        self.send(
            self.http
                .post(&url)
                .query(&[("uploadType", "media"), ("name", name)])
                .header(CONTENT_TYPE, "text/csv")
                .body(body),
        )
        .await
        .map_err(|e| {
            LoadError::ObjectStorage(format!("uploading gs://{}/{name}: {e}", self.target.gcs_bucket))
        })?;
        Ok(())
    }

    async fn delete_object(&self, name: &str) {
        let deleted = async {
            let mut url = Url::parse(&format!("{}/storage/v1/b/{}/o", self.storage_api, self.target.gcs_bucket))
                .map_err(|e| LoadError::ObjectStorage(e.to_string()))?;
            url.path_segments_mut()
                .map_err(|_| LoadError::ObjectStorage("storage endpoint cannot hold paths".into()))?
                .push(name);
            self.send(self.http.delete(url)).await
        }
        .await;
        if let Err(err) = deleted {
            warn!(bucket = %self.target.gcs_bucket, object = name, error = %err, "failed to delete staged object");
        }
    }

    /// Upload, run a load job into `table`, then delete the staged object whatever the outcome.
    async fn load_via_storage(
        &self,
        table: &str,
        batch: &LoadBatch,
        write_disposition: &str,
    ) -> Result<u64, LoadError> {
        let name = self.target.object_name();
        self.upload(&name, batch.to_csv()?).await?;
        let uri = format!("gs://{}/{name}", self.target.gcs_bucket);
        debug!(table, %uri, rows = batch.len(), "staged batch in cloud storage");

        let loaded = self
            .run_job(json!({
                "load": {
                    "sourceUris": [uri],
                    "destinationTable": {
                        "projectId": self.project_id,
                        "datasetId": self.target.dataset_id,
                        "tableId": table,
                    },
                    "sourceFormat": "CSV",
                    "skipLeadingRows": 1,
                    "allowQuotedNewlines": true,
                    "writeDisposition": write_disposition,
                }
            }))
            .await;
        self.delete_object(&name).await;

        let job = loaded?;
        Ok(job
            .statistics
            .and_then(|s| s.load)
            .and_then(|l| l.output_rows)
            .and_then(|rows| rows.parse().ok())
            .unwrap_or(0))
    }

    async fn merge_staged(
        &self,
        plan: &MergePlan,
        staging_table: &str,
        aligned: &LoadBatch,
    ) -> Result<(), LoadError> {
        self.load_via_storage(staging_table, aligned, "WRITE_TRUNCATE")
            .await?;
        self.query(&plan.bigquery_merge_sql(|t| self.table_path(t))).await
    }
}

/// Each statement and load job commits on completion; there is no enclosing transaction.
pub struct BigQueryLoader {
    target: BigQueryTarget,
    bigquery_api: String,
    storage_api: String,
    tokens: Option<Arc<dyn TokenSource>>,
    poll_interval: Duration,
    session: Option<Session>,
}

impl BigQueryLoader {
    pub fn new(target: BigQueryTarget) -> Result<Self, LoadError> {
        if target.gcs_bucket.trim().is_empty() {
            return Err(LoadError::Invalid(
                "bigquery loads need a cloud storage bucket for staging".to_string(),
            ));
        }
        if target.dataset_id.trim().is_empty() {
            return Err(LoadError::Invalid("bigquery loads need a dataset".to_string()));
        }
        Ok(Self {
            target,
            bigquery_api: BIGQUERY_API.to_string(),
            storage_api: STORAGE_API.to_string(),
            tokens: None,
            poll_interval: Duration::from_secs(1),
            session: None,
        })
    }

    pub fn with_endpoints(mut self, bigquery_api: impl Into<String>, storage_api: impl Into<String>) -> Self {
        self.bigquery_api = bigquery_api.into().trim_end_matches('/').to_string();
        self.storage_api = storage_api.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_token_source(mut self, tokens: Arc<dyn TokenSource>) -> Self {
        self.tokens = Some(tokens);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn session(&self) -> Result<&Session, LoadError> {
        self.session.as_ref().ok_or(LoadError::NotConnected)
    }
}

#[async_trait]
impl Loader for BigQueryLoader {
    async fn connect(&mut self) -> Result<(), LoadError> {
        if self.session.is_some() {
            return Ok(());
        }
        let tokens: Arc<dyn TokenSource> = match &self.tokens {
            Some(tokens) => Arc::clone(tokens),
            None => {
                let provider = gcp_auth::provider()
                    .await
                    .map_err(|e| LoadError::Warehouse(format!("loading google credentials: {e}")))?;
                Arc::new(DefaultCredentials(provider))
            }
        };
        let project_id = match &self.target.project_id {
            Some(id) if !id.trim().is_empty() => id.clone(),
            _ => tokens.project_id().await?,
        };
        let http = Client::builder().build().map_err(api_error)?;
        info!(project = %project_id, dataset = %self.target.dataset_id, "connected to bigquery");
        self.session = Some(Session {
            http,
            tokens,
            project_id,
            bigquery_api: self.bigquery_api.clone(),
            storage_api: self.storage_api.clone(),
            target: self.target.clone(),
            poll_interval: self.poll_interval,
        });
        Ok(())
    }

    async fn close(&mut self) -> Result<(), LoadError> {
        if self.session.take().is_some() {
            debug!("bigquery session closed");
        }
        Ok(())
    }

    async fn prepare_schema(&mut self) -> Result<(), LoadError> {
        let session = self.session()?;
        let dataset = quote_bigquery(&format!("{}.{}", session.project_id, session.target.dataset_id));
        let location = serde_json::to_string(&session.target.location)
            .map_err(|e| LoadError::Invalid(e.to_string()))?;
        session
            .query(&format!(
                "CREATE SCHEMA IF NOT EXISTS {dataset} OPTIONS (location = {location})"
            ))
            .await?;
        for (table, columns, suffix) in SCHEMA {
            session
                .query(&format!(
                    "CREATE TABLE IF NOT EXISTS {} ({columns}){suffix}",
                    session.table_path(table)
                ))
                .await?;
        }
        debug!("bigquery schema ensured");
        Ok(())
    }

    async fn bulk_load(&mut self, table: &str, batch: &LoadBatch) -> Result<(), LoadError> {
        ensure_known_table(table)?;
        if batch.is_empty() {
            return Ok(());
        }
        let session = self.session()?;
        let columns = session.table_columns(table).await?;
        let aligned = batch
            .project(&loadable_columns(batch, &columns))
            .align(&columns);
        let loaded = session
            .load_via_storage(table, &aligned, "WRITE_APPEND")
            .await?;
        info!(table, rows = loaded, "bulk loaded");
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
        let session = self.session()?;
        let columns = session.table_columns(table).await?;
        let staging_table = staging_name(table);
        let plan = MergePlan::new(table, &staging_table, batch.columns(), &columns, conflict_keys)?;
        let aligned = batch.project(plan.columns()).align(&columns);

        session
            .query(&format!(
                "CREATE TABLE {} LIKE {} OPTIONS (expiration_timestamp = TIMESTAMP_ADD(CURRENT_TIMESTAMP(), INTERVAL 1 DAY))",
                session.table_path(&staging_table),
                session.table_path(table)
            ))
            .await?;

        let merged = session.merge_staged(&plan, &staging_table, &aligned).await;
        if let Err(err) = session
            .query(&format!("DROP TABLE IF EXISTS {}", session.table_path(&staging_table)))
            .await
        {
            warn!(table = %staging_table, error = %err, "failed to drop staging table");
        }

        merged?;
        info!(table, staged = batch.len(), "upserted");
        Ok(())
    }

    async fn truncate(&mut self, tables: &[&str]) -> Result<(), LoadError> {
        for table in tables {
            ensure_known_table(table)?;
        }
        let session = self.session()?;
        for table in tables {
            session
                .query(&format!("TRUNCATE TABLE {}", session.table_path(table)))
                .await?;
        }
        info!(?tables, "truncated");
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), LoadError> {
        self.session()?;
        debug!("bigquery jobs already applied");
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), LoadError> {
        if self.session.is_some() {
            warn!("bigquery has no open transaction; completed jobs stay applied");
        }
        Ok(())
    }
}
