use std::path::PathBuf;
use std::time::Duration;

use ctr_storage::http::DEFAULT_USER_AGENT;
use ctr_storage::{HttpClientConfig, RetryPolicy, S3Location};

use crate::loader::BigQueryTarget;

pub const DEFAULT_BASE_URL: &str = "https://www.clinicaltrialsregister.eu/ctr-search";
pub const DEFAULT_COUNTRY_PRIORITY: &[&str] = &["3rd", "GB", "DE"];
pub const PENDING_LEDGER_FILE: &str = "pending_ids.txt";

/// Runtime settings for both pipeline phases, read from `CTR_*` environment variables.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub base_url: String,
    pub state_file: PathBuf,
    pub bronze_dir: PathBuf,
    pub s3: Option<S3Location>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub sleep_seconds: f64,
    pub workers: usize,
    pub country_priority: Vec<String>,
    pub database_url: Option<String>,
    pub redshift_iam_role: Option<String>,
    pub bigquery: BigQueryTarget,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            state_file: PathBuf::from("data/state.json"),
            bronze_dir: PathBuf::from("data/bronze"),
            s3: None,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            http_timeout_secs: 30,
            sleep_seconds: 1.0,
            workers: default_workers(),
            country_priority: DEFAULT_COUNTRY_PRIORITY
                .iter()
                .map(|c| c.to_string())
                .collect(),
            database_url: None,
            redshift_iam_role: None,
            bigquery: BigQueryTarget::default(),
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let s3 = non_empty_var("CTR_S3_BUCKET").map(|bucket| S3Location {
            bucket,
            prefix: std::env::var("CTR_S3_PREFIX").unwrap_or_default(),
            region: non_empty_var("CTR_S3_REGION"),
            endpoint: non_empty_var("CTR_S3_ENDPOINT"),
        });

        Self {
            base_url: std::env::var("CTR_BASE_URL").unwrap_or(defaults.base_url),
            state_file: std::env::var("CTR_STATE_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.state_file),
            bronze_dir: std::env::var("CTR_BRONZE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.bronze_dir),
            s3,
            user_agent: std::env::var("CTR_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: std::env::var("CTR_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.http_timeout_secs),
            sleep_seconds: std::env::var("CTR_SLEEP_SECONDS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.sleep_seconds),
            workers: std::env::var("CTR_WORKERS")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.workers),
            country_priority: non_empty_var("CTR_COUNTRY_PRIORITY")
                .map(|v| parse_country_list(&v))
                .filter(|list| !list.is_empty())
                .unwrap_or(defaults.country_priority),
            database_url: non_empty_var("DATABASE_URL"),
            redshift_iam_role: non_empty_var("CTR_REDSHIFT_IAM_ROLE"),
            bigquery: BigQueryTarget {
                project_id: non_empty_var("CTR_BQ_PROJECT")
                    .or_else(|| non_empty_var("GOOGLE_CLOUD_PROJECT")),
                dataset_id: non_empty_var("CTR_BQ_DATASET").unwrap_or(defaults.bigquery.dataset_id),
                location: non_empty_var("CTR_BQ_LOCATION").unwrap_or(defaults.bigquery.location),
                gcs_bucket: non_empty_var("CTR_GCS_BUCKET").unwrap_or_default(),
                gcs_prefix: std::env::var("CTR_GCS_PREFIX").unwrap_or_default(),
            },
        }
    }

    /// Delay before every upstream request; negative or non-finite values mean no delay.
    pub fn politeness(&self) -> Duration {
        Duration::try_from_secs_f64(self.sleep_seconds).unwrap_or(Duration::ZERO)
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            retry: RetryPolicy::default(),
        }
    }

    /// Pending-identifier ledger, kept next to the state document.
    pub fn ledger_path(&self) -> PathBuf {
        match self.state_file.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.join(PENDING_LEDGER_FILE),
            _ => PathBuf::from(PENDING_LEDGER_FILE),
        }
    }

    /// Object location for Redshift staging files: a nested prefix that bronze listings skip.
    pub fn redshift_staging_location(&self) -> Option<S3Location> {
        self.s3.as_ref().map(|s3| {
            let base = s3.prefix.trim_end_matches('/');
            let prefix = if base.is_empty() {
                "_staging".to_string()
            } else {
                format!("{base}/_staging")
            };
            S3Location {
                prefix,
                ..s3.clone()
            }
        })
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_country_list(value: &str) -> Vec<String> {
    value
        .split(|c: char| c == ',' || c.is_whitespace())
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .collect()
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_registry_and_fallback_order() {
        let config = PipelineConfig::default();
        assert_eq!(config.base_url, DEFAULT_BASE_URL);
        assert_eq!(config.country_priority, vec!["3rd", "GB", "DE"]);
        assert_eq!(config.ledger_path(), PathBuf::from("data/pending_ids.txt"));
        assert!(config.workers >= 1);
    }

    #[test]
    fn politeness_tolerates_bad_values() {
        let mut config = PipelineConfig {
            sleep_seconds: 0.25,
            ..Default::default()
        };
        assert_eq!(config.politeness(), Duration::from_millis(250));
        config.sleep_seconds = -1.0;
        assert_eq!(config.politeness(), Duration::ZERO);
        config.sleep_seconds = f64::NAN;
        assert_eq!(config.politeness(), Duration::ZERO);
    }

    #[test]
    fn country_lists_accept_commas_or_spaces() {
        assert_eq!(parse_country_list("3rd, GB DE"), vec!["3rd", "GB", "DE"]);
        assert!(parse_country_list(" , ").is_empty());
    }

    #[test]
    fn redshift_staging_nests_under_bronze_prefix() {
        let config = PipelineConfig {
            s3: Some(S3Location {
                bucket: "bronze".into(),
                prefix: "euctr/".into(),
                ..Default::default()
            }),
            ..Default::default()
        };
        let staging = config.redshift_staging_location().expect("s3 configured");
        assert_eq!(staging.bucket, "bronze");
        assert_eq!(staging.prefix, "euctr/_staging");
        assert!(PipelineConfig::default().redshift_staging_location().is_none());
    }
}
