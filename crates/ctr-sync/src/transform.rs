//! Windowed, pooled parse of stored trial pages into load batches.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use ctr_adapters::RecordMapper;
use ctr_core::{HashSidecar, ParsedRecord, StoredDocument, Trial, TrialCondition, TrialDrug};
use ctr_storage::ContentStore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::fetch::sidecar_key;
use crate::staging::LoadBatch;

pub const DOCUMENT_PATTERN: &str = "*.html";

/// Documents with `since < modified_at <= run_start`, in key order.
pub fn select_window(
    documents: Vec<StoredDocument>,
    since: Option<DateTime<Utc>>,
    run_start: DateTime<Utc>,
) -> Vec<StoredDocument> {
    let mut selected: Vec<StoredDocument> = documents
        .into_iter()
        .filter(|doc| since.map_or(true, |since| doc.modified_at > since))
        .filter(|doc| doc.modified_at <= run_start)
        .collect();
    selected.sort_by(|a, b| a.key.cmp(&b.key));
    selected
}

/// Tagged result of one parse task.
#[derive(Debug)]
enum ParseOutcome {
    Parsed(ParsedRecord),
    Failed { key: String, reason: String },
}

fn parse_document(
    mapper: &dyn RecordMapper,
    key: String,
    content: String,
    source_url: String,
) -> ParseOutcome {
    match catch_unwind(AssertUnwindSafe(|| mapper.map_document(&content, &source_url))) {
        Ok(Ok(record)) => ParseOutcome::Parsed(record),
        Ok(Err(err)) => ParseOutcome::Failed {
            key,
            reason: err.to_string(),
        },
        Err(_) => ParseOutcome::Failed {
            key,
            reason: "mapper panicked".to_string(),
        },
    }
}

#[derive(Debug)]
pub struct TransformOutput {
    pub selected: usize,
    pub parsed: usize,
    pub failed: usize,
    pub trials: LoadBatch,
    pub drugs: LoadBatch,
    pub conditions: LoadBatch,
}

impl TransformOutput {
    /// Batches in parent-first delivery order.
    pub fn batches(&self) -> [&LoadBatch; 3] {
        [&self.trials, &self.drugs, &self.conditions]
    }

    fn from_records(selected: usize, failed: usize, mut records: Vec<ParsedRecord>, run_start: DateTime<Utc>) -> Self {
        records.sort_by(|a, b| a.identifier().cmp(b.identifier()));
        let parsed = records.len();

        let mut trials: Vec<Trial> = Vec::with_capacity(parsed);
        let mut drugs: Vec<TrialDrug> = Vec::new();
        let mut conditions: Vec<TrialCondition> = Vec::new();
        for record in records {
            let mut trial = record.trial;
            trial.last_updated = Some(run_start);
            trials.push(trial);
            drugs.extend(record.drugs);
            conditions.extend(record.conditions);
        }

        Self {
            selected,
            parsed,
            failed,
            trials: LoadBatch::from_rows(&trials),
            drugs: LoadBatch::from_rows(&drugs),
            conditions: LoadBatch::from_rows(&conditions),
        }
    }
}

pub struct TransformStage {
    store: Arc<dyn ContentStore>,
    mapper: Arc<dyn RecordMapper>,
    workers: usize,
}

impl TransformStage {
    pub fn new(store: Arc<dyn ContentStore>, mapper: Arc<dyn RecordMapper>, workers: usize) -> Self {
        Self {
            store,
            mapper,
            workers: workers.max(1),
        }
    }

    /// Parse every document in the window. Mapper failures are logged and counted, not raised.
    pub async fn run(&self, since: Option<DateTime<Utc>>, run_start: DateTime<Utc>) -> Result<TransformOutput> {
        let listed = self
            .store
            .list_matching(DOCUMENT_PATTERN)
            .await
            .with_context(|| format!("listing {DOCUMENT_PATTERN} in {}", self.store.describe()))?;
        let total = listed.len();
        let selected = select_window(listed, since, run_start);
        info!(
            total,
            selected = selected.len(),
            since = ?since,
            %run_start,
            "selected documents for transform"
        );

        let mut failed = 0usize;
        let mut records = Vec::with_capacity(selected.len());
        let mut pool = JoinSet::new();

        for doc in &selected {
            while pool.len() >= self.workers {
                if let Some(joined) = pool.join_next().await {
                    collect(joined, &mut records, &mut failed);
                }
            }

            let content = match self.store.read(&doc.key).await {
                Ok(content) => content,
                Err(err) if err.is_not_found() => {
                    warn!(key = %doc.key, "document vanished before it could be read");
                    failed += 1;
                    continue;
                }
                Err(err) => {
                    pool.abort_all();
                    return Err(err).with_context(|| format!("reading {}", doc.key));
                }
            };
            let source_url = self.source_url(doc).await;
            let mapper = Arc::clone(&self.mapper);
            let key = doc.key.clone();
            debug!(key = %key, "dispatching parse");
            pool.spawn_blocking(move || parse_document(mapper.as_ref(), key, content, source_url));
        }

        while let Some(joined) = pool.join_next().await {
            collect(joined, &mut records, &mut failed);
        }

        let output = TransformOutput::from_records(selected.len(), failed, records, run_start);
        info!(
            selected = output.selected,
            parsed = output.parsed,
            failed = output.failed,
            trials = output.trials.len(),
            drugs = output.drugs.len(),
            conditions = output.conditions.len(),
            "transform complete"
        );
        Ok(output)
    }

    /// Fetch URL from the page's sidecar, or empty when there is none.
    async fn source_url(&self, doc: &StoredDocument) -> String {
        let key = sidecar_key(doc.stem());
        match self.store.read(&key).await {
            Ok(text) => HashSidecar::parse_meta_text(&text)
                .map(|sidecar| sidecar.url)
                .unwrap_or_default(),
            Err(err) if err.is_not_found() => String::new(),
            Err(err) => {
                debug!(%key, error = %err, "sidecar unreadable; no source url");
                String::new()
            }
        }
    }
}

fn collect(
    joined: Result<ParseOutcome, tokio::task::JoinError>,
    records: &mut Vec<ParsedRecord>,
    failed: &mut usize,
) {
    match joined {
        Ok(ParseOutcome::Parsed(record)) => records.push(record),
        Ok(ParseOutcome::Failed { key, reason }) => {
            warn!(%key, %reason, "skipping document that could not be mapped");
            *failed += 1;
        }
        Err(err) => {
            warn!(error = %err, "parse task did not complete");
            *failed += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use ctr_adapters::MapError;
    use ctr_storage::LocalContentStore;

    fn doc(key: &str, at: DateTime<Utc>) -> StoredDocument {
        StoredDocument {
            key: key.to_string(),
            modified_at: at,
        }
    }

    #[test]
    fn window_is_open_below_and_closed_above() {
        let since = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let run_start = since + Duration::hours(1);
        let docs = vec![
            doc("c.html", since + Duration::minutes(5)),
            doc("at-since.html", since),
            doc("before.html", since - Duration::seconds(1)),
            doc("at-start.html", run_start),
            doc("after.html", run_start + Duration::milliseconds(1)),
            doc("a.html", since + Duration::milliseconds(1)),
        ];
        let keys: Vec<String> = select_window(docs, Some(since), run_start)
            .into_iter()
            .map(|d| d.key)
            .collect();
        assert_eq!(keys, vec!["a.html", "at-start.html", "c.html"]);
    }

    #[test]
    fn no_watermark_selects_everything_up_to_run_start() {
        let run_start = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let docs = vec![
            doc("old.html", run_start - Duration::days(400)),
            doc("future.html", run_start + Duration::seconds(1)),
        ];
        let selected = select_window(docs, None, run_start);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].key, "old.html");
    }

    struct FirstLineMapper;

    impl RecordMapper for FirstLineMapper {
        fn map_document(&self, content: &str, source_url: &str) -> Result<ParsedRecord, MapError> {
            let id = content.lines().next().unwrap_or_default().trim();
            if id.is_empty() {
                return Err(MapError::NoIdentifier);
            }
            if id == "boom" {
                panic!("mapper bug");
            }
            Ok(ParsedRecord {
                trial: Trial {
                    eudract_number: id.to_string(),
                    sponsor_name: Some("Sponsor".into()),
                    trial_title: None,
                    start_date: None,
                    trial_status: None,
                    age_groups: None,
                    url_source: Some(source_url.to_string()).filter(|u| !u.is_empty()),
                    last_updated: None,
                },
                drugs: vec![TrialDrug {
                    eudract_number: id.to_string(),
                    drug_name: Some("Placebo".into()),
                    active_ingredient: None,
                    pharmaceutical_form: None,
                    cas_number: None,
                }],
                conditions: vec![],
            })
        }
    }

    #[tokio::test]
    async fn failures_are_isolated_and_batches_stamped_with_run_start() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(LocalContentStore::new(dir.path()));
        store.write("2004-000002-22.html", "2004-000002-22\n").await.expect("write");
        store.write("2004-000001-11.html", "2004-000001-11\n").await.expect("write");
        store.write("empty.html", "\n").await.expect("write");
        store.write("panics.html", "boom\n").await.expect("write");
        store.write("notes.txt", "2009-000009-99\n").await.expect("write");
        store
            .write(
                "2004-000001-11.meta",
                "source_country=GB\nurl=https://example.test/trial/2004-000001-11/GB\nfetched_at=2025-01-01T00:00:00+00:00\nhash=ab\n",
            )
            .await
            .expect("write");

        let run_start = Utc::now() + Duration::seconds(5);
        let stage = TransformStage::new(store, Arc::new(FirstLineMapper), 2);
        let output = stage.run(None, run_start).await.expect("transform");

        assert_eq!(output.selected, 4);
        assert_eq!(output.parsed, 2);
        assert_eq!(output.failed, 2);
        assert_eq!(output.trials.len(), 2);
        assert_eq!(output.trials.rows()[0][0], "2004-000001-11");
        assert_eq!(
            output.trials.rows()[0][6],
            "https://example.test/trial/2004-000001-11/GB"
        );
        let stamp = run_start.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string();
        assert!(output.trials.rows().iter().all(|row| row[7] == stamp));
        assert_eq!(output.drugs.len(), 2);
        assert!(output.conditions.is_empty());
        assert_eq!(output.batches()[0].table(), ctr_core::TRIALS_TABLE);
    }
}
