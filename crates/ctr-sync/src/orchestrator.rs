//! Bronze (harvest + fetch) and silver (transform + load) phases.

use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDate, SubsecRound, Utc};
use ctr_adapters::{LabelMapper, RecordMapper};
use ctr_storage::{ContentStore, HttpFetcher, LocalContentStore, S3ContentStore, StateStore};
use futures::TryStreamExt;
use tracing::{info, warn};

use crate::config::{PipelineConfig, PENDING_LEDGER_FILE};
use crate::fetch::{FetchOutcome, Fetcher};
use crate::harvest::{HarvestRequest, Harvester};
use crate::loader::{
    conflict_keys, BigQueryLoader, LoadMode, Loader, PostgresLoader, RedshiftLoader, TRUNCATE_ORDER,
};
use crate::transform::{TransformOutput, TransformStage};

/// Raw page store for the configured backend: S3 when a bucket is set, else the bronze directory.
pub async fn build_content_store(config: &PipelineConfig) -> Arc<dyn ContentStore> {
    match &config.s3 {
        Some(location) => Arc::new(S3ContentStore::connect(location.clone()).await),
        None => Arc::new(LocalContentStore::new(&config.bronze_dir)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WarehouseTarget {
    #[default]
    Postgres,
    Redshift,
    BigQuery,
}

pub fn build_loader(config: &PipelineConfig, target: WarehouseTarget) -> Result<Box<dyn Loader>> {
    let database_url = || {
        config
            .database_url
            .clone()
            .ok_or_else(|| anyhow!("DATABASE_URL is required to load the warehouse"))
    };
    match target {
        WarehouseTarget::Postgres => Ok(Box::new(PostgresLoader::new(database_url()?))),
        WarehouseTarget::Redshift => {
            let database_url = database_url()?;
            let iam_role = config
                .redshift_iam_role
                .clone()
                .ok_or_else(|| anyhow!("an IAM role is required for redshift loads"))?;
            let staging = config
                .redshift_staging_location()
                .ok_or_else(|| anyhow!("an S3 bucket is required to stage redshift loads"))?;
            Ok(Box::new(RedshiftLoader::new(database_url, iam_role, staging)?))
        }
        WarehouseTarget::BigQuery => Ok(Box::new(BigQueryLoader::new(config.bigquery.clone())?)),
    }
}

/// Identifiers harvested but not yet fetched, one per line.
pub struct PendingLedger {
    store: LocalContentStore,
    file: String,
}

impl PendingLedger {
    /// Ledger file at `path`, normally [`PipelineConfig::ledger_path`].
    pub fn at(path: &Path) -> Self {
        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => Path::new(".").to_path_buf(),
        };
        let file = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| PENDING_LEDGER_FILE.to_string());
        Self {
            store: LocalContentStore::new(dir),
            file,
        }
    }

    /// Distinct identifiers in first-seen order.
    pub async fn load(&self) -> Result<Vec<String>> {
        let text = match self.store.read(&self.file).await {
            Ok(text) => text,
            Err(err) if err.is_not_found() => return Ok(Vec::new()),
            Err(err) => return Err(err).context("reading pending identifier ledger"),
        };
        let mut seen = std::collections::HashSet::new();
        Ok(text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .filter(|line| seen.insert(line.to_string()))
            .map(str::to_string)
            .collect())
    }

    pub async fn append(&self, identifiers: &[String]) -> Result<()> {
        if identifiers.is_empty() {
            return Ok(());
        }
        let mut text = match self.store.read(&self.file).await {
            Ok(text) => text,
            Err(err) if err.is_not_found() => String::new(),
            Err(err) => return Err(err).context("reading pending identifier ledger"),
        };
        if !text.is_empty() && !text.ends_with('\n') {
            text.push('\n');
        }
        for id in identifiers {
            text.push_str(id);
            text.push('\n');
        }
        self.store
            .write(&self.file, &text)
            .await
            .context("writing pending identifier ledger")
    }

    pub async fn clear(&self) -> Result<()> {
        self.store
            .write(&self.file, "")
            .await
            .context("clearing pending identifier ledger")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BronzeOptions {
    pub start_page: u32,
    pub max_pages: u32,
    pub ignore_hwm: bool,
    pub date_to: Option<NaiveDate>,
}

impl Default for BronzeOptions {
    fn default() -> Self {
        Self {
            start_page: 1,
            max_pages: 1,
            ignore_hwm: false,
            date_to: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BronzeSummary {
    pub pages: u32,
    pub identifiers: usize,
    pub written: usize,
    pub unchanged: usize,
    pub missing: usize,
}

pub struct BronzePhase {
    state: StateStore,
    ledger: PendingLedger,
    harvester: Harvester,
    fetcher: Fetcher,
}

impl BronzePhase {
    pub fn new(state: StateStore, ledger: PendingLedger, harvester: Harvester, fetcher: Fetcher) -> Self {
        Self {
            state,
            ledger,
            harvester,
            fetcher,
        }
    }

    pub async fn from_config(config: &PipelineConfig) -> Result<Self> {
        let http = HttpFetcher::new(config.http_client_config())?;
        let store = build_content_store(config).await;
        let harvester = Harvester::new(http.clone(), &config.base_url, config.politeness())?;
        let fetcher = Fetcher::new(
            http,
            store,
            &config.base_url,
            config.country_priority.clone(),
            config.politeness(),
        );
        Ok(Self::new(
            StateStore::new(&config.state_file),
            PendingLedger::at(&config.ledger_path()),
            harvester,
            fetcher,
        ))
    }

    pub async fn run(&self, options: BronzeOptions) -> Result<BronzeSummary> {
        let state = self.state.load().await;
        let date_from = if options.ignore_hwm {
            info!("ignoring high-water mark; full re-crawl");
            None
        } else {
            state.high_water_mark()
        };

        let mut start_page = options.start_page.max(1);
        if !options.ignore_hwm && start_page == 1 {
            if let Some(cursor) = state.crawl_cursor() {
                start_page = cursor.saturating_add(1);
                info!(cursor, start_page, "resuming crawl after saved cursor");
            }
        }
        info!(start_page, max_pages = options.max_pages, date_from = ?date_from, "starting harvest");

        let request = HarvestRequest {
            start_page,
            max_pages: options.max_pages,
            date_from,
            date_to: options.date_to,
        };
        let mut summary = BronzeSummary::default();
        let mut newest_listed: Option<NaiveDate> = None;

        let mut pages = std::pin::pin!(self.harvester.harvest(request));
        while let Some(page) = pages
            .try_next()
            .await
            .context("harvesting search results")?
        {
            let identifiers: Vec<String> = page
                .identifiers
                .iter()
                .map(|c| c.identifier.clone())
                .collect();
            self.ledger.append(&identifiers).await?;
            self.state
                .set_crawl_cursor(page.page)
                .await
                .context("saving crawl cursor")?;
            newest_listed = newest_listed.max(page.max_listed_date());
            summary.pages += 1;
            info!(page = page.page, identifiers = identifiers.len(), "page harvested");
        }

        let pending = self.ledger.load().await?;
        summary.identifiers = pending.len();
        info!(pending = pending.len(), "fetching trial pages");
        for identifier in &pending {
            match self.fetcher.fetch_outcome(identifier).await? {
                FetchOutcome::Written { .. } => summary.written += 1,
                FetchOutcome::Unchanged { .. } => summary.unchanged += 1,
                FetchOutcome::Missing => summary.missing += 1,
            }
        }
        self.ledger.clear().await?;

        match newest_listed {
            Some(date) => {
                self.state
                    .set_high_water_mark(date)
                    .await
                    .context("saving high-water mark")?;
                info!(%date, "high-water mark advanced");
            }
            None if !pending.is_empty() => {
                warn!("no listed dates seen; high-water mark unchanged");
            }
            None => {}
        }

        info!(
            pages = summary.pages,
            identifiers = summary.identifiers,
            written = summary.written,
            unchanged = summary.unchanged,
            missing = summary.missing,
            "bronze run complete"
        );
        Ok(summary)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SilverSummary {
    pub run_start: DateTime<Utc>,
    pub selected: usize,
    pub parsed: usize,
    pub failed: usize,
    pub loaded: bool,
}

pub struct SilverPhase {
    state: StateStore,
    stage: TransformStage,
    mode: LoadMode,
}

impl SilverPhase {
    pub fn new(state: StateStore, stage: TransformStage, mode: LoadMode) -> Self {
        Self { state, stage, mode }
    }

    pub async fn from_config(config: &PipelineConfig, mode: LoadMode) -> Result<Self> {
        let store = build_content_store(config).await;
        let mapper: Arc<dyn RecordMapper> =
            Arc::new(LabelMapper::new().context("compiling record mapper patterns")?);
        Ok(Self::new(
            StateStore::new(&config.state_file),
            TransformStage::new(store, mapper, config.workers),
            mode,
        ))
    }

    /// Transform the window since the last committed run and deliver it.
    ///
    /// The watermark moves to this run's start only after the loader commits.
    pub async fn run(&self, loader: &mut dyn Loader) -> Result<SilverSummary> {
        let run_start = Utc::now().trunc_subsecs(3);
        let since = self.state.silver_watermark().await;
        let output = self.stage.run(since, run_start).await?;

        let mut summary = SilverSummary {
            run_start,
            selected: output.selected,
            parsed: output.parsed,
            failed: output.failed,
            loaded: false,
        };
        if output.selected == 0 || output.trials.is_empty() {
            info!(selected = output.selected, "nothing to load; watermark unchanged");
            return Ok(summary);
        }

        if let Err(err) = self.deliver(loader, &output).await {
            if let Err(rollback_err) = loader.rollback().await {
                warn!(error = %rollback_err, "rollback failed");
            }
            if let Err(close_err) = loader.close().await {
                warn!(error = %close_err, "closing loader failed");
            }
            return Err(err);
        }

        let saved = self
            .state
            .set_silver_watermark(run_start)
            .await
            .context("saving silver watermark");
        if let Err(close_err) = loader.close().await {
            warn!(error = %close_err, "closing loader after commit failed");
        }
        saved?;

        summary.loaded = true;
        info!(%run_start, parsed = summary.parsed, failed = summary.failed, "silver run committed");
        Ok(summary)
    }

    async fn deliver(&self, loader: &mut dyn Loader, output: &TransformOutput) -> Result<()> {
        loader.connect().await.context("connecting to warehouse")?;
        loader.prepare_schema().await.context("preparing warehouse schema")?;

        match self.mode {
            LoadMode::Full => {
                loader
                    .truncate(TRUNCATE_ORDER)
                    .await
                    .context("truncating target tables")?;
                for batch in output.batches() {
                    loader
                        .bulk_load(batch.table(), batch)
                        .await
                        .with_context(|| format!("loading {}", batch.table()))?;
                }
            }
            LoadMode::Upsert => {
                for batch in output.batches() {
                    loader
                        .upsert(batch.table(), batch, conflict_keys(batch.table()))
                        .await
                        .with_context(|| format!("upserting {}", batch.table()))?;
                }
            }
        }

        loader.commit().await.context("committing load")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ledger_dedups_and_survives_until_cleared() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = PipelineConfig {
            state_file: dir.path().join("state.json"),
            ..Default::default()
        };
        let ledger = PendingLedger::at(&config.ledger_path());
        assert!(ledger.load().await.expect("load").is_empty());

        ledger
            .append(&["A".to_string(), "B".to_string()])
            .await
            .expect("append");
        ledger
            .append(&["B".to_string(), "C".to_string()])
            .await
            .expect("append");
        assert_eq!(ledger.load().await.expect("load"), vec!["A", "B", "C"]);
        assert!(dir.path().join(PENDING_LEDGER_FILE).exists());

        ledger.clear().await.expect("clear");
        assert!(ledger.load().await.expect("load").is_empty());
    }

    #[test]
    fn loader_selection_needs_database_and_role() {
        let config = PipelineConfig::default();
        assert!(build_loader(&config, WarehouseTarget::Postgres).is_err());

        let config = PipelineConfig {
            database_url: Some("postgres://localhost/ctr".into()),
            ..Default::default()
        };
        assert!(build_loader(&config, WarehouseTarget::Postgres).is_ok());
        assert!(build_loader(&config, WarehouseTarget::Redshift).is_err());
        assert!(build_loader(&config, WarehouseTarget::BigQuery).is_err());

        let config = PipelineConfig {
            bigquery: crate::loader::BigQueryTarget {
                gcs_bucket: "staging".into(),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(build_loader(&config, WarehouseTarget::BigQuery).is_ok());
    }
}
