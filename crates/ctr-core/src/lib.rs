//! Core domain model for the clinical trials register pipeline.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "ctr-core";

pub const TRIALS_TABLE: &str = "eu_trials";
pub const DRUGS_TABLE: &str = "eu_trial_drugs";
pub const CONDITIONS_TABLE: &str = "eu_trial_conditions";

/// A single staged cell before CSV encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cell {
    Null,
    Text(String),
    List(Vec<String>),
}

impl Cell {
    pub fn opt_text(value: Option<&str>) -> Self {
        match value {
            Some(v) => Cell::Text(v.to_string()),
            None => Cell::Null,
        }
    }
}

/// Row shape shared by every record type delivered to a warehouse table.
pub trait TableRow {
    const TABLE: &'static str;
    const COLUMNS: &'static [&'static str];

    /// Cells in `COLUMNS` order.
    fn cells(&self) -> Vec<Cell>;
}

/// Core trial entity (register header plus sections A and B).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trial {
    pub eudract_number: String,
    pub sponsor_name: Option<String>,
    pub trial_title: Option<String>,
    pub start_date: Option<NaiveDate>,
    pub trial_status: Option<String>,
    pub age_groups: Option<Vec<String>>,
    pub url_source: Option<String>,
    pub last_updated: Option<DateTime<Utc>>,
}

impl TableRow for Trial {
    const TABLE: &'static str = TRIALS_TABLE;
    const COLUMNS: &'static [&'static str] = &[
        "eudract_number",
        "sponsor_name",
        "trial_title",
        "start_date",
        "trial_status",
        "age_groups",
        "url_source",
        "last_updated",
    ];

    fn cells(&self) -> Vec<Cell> {
        vec![
            Cell::Text(self.eudract_number.clone()),
            Cell::opt_text(self.sponsor_name.as_deref()),
            Cell::opt_text(self.trial_title.as_deref()),
            self.start_date
                .map(|d| Cell::Text(d.format("%Y-%m-%d").to_string()))
                .unwrap_or(Cell::Null),
            Cell::opt_text(self.trial_status.as_deref()),
            self.age_groups
                .clone()
                .map(Cell::List)
                .unwrap_or(Cell::Null),
            Cell::opt_text(self.url_source.as_deref()),
            self.last_updated
                .map(|ts| Cell::Text(ts.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()))
                .unwrap_or(Cell::Null),
        ]
    }
}

/// Investigational medicinal product (section D), many per trial.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrialDrug {
    pub eudract_number: String,
    pub drug_name: Option<String>,
    pub active_ingredient: Option<String>,
    pub pharmaceutical_form: Option<String>,
    pub cas_number: Option<String>,
}

impl TableRow for TrialDrug {
    const TABLE: &'static str = DRUGS_TABLE;
    const COLUMNS: &'static [&'static str] = &[
        "eudract_number",
        "drug_name",
        "active_ingredient",
        "pharmaceutical_form",
        "cas_number",
    ];

    fn cells(&self) -> Vec<Cell> {
        vec![
            Cell::Text(self.eudract_number.clone()),
            Cell::opt_text(self.drug_name.as_deref()),
            Cell::opt_text(self.active_ingredient.as_deref()),
            Cell::opt_text(self.pharmaceutical_form.as_deref()),
            Cell::opt_text(self.cas_number.as_deref()),
        ]
    }
}

/// Medical condition under investigation (section E), many per trial.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrialCondition {
    pub eudract_number: String,
    pub condition_name: Option<String>,
    pub meddra_code: Option<String>,
}

impl TableRow for TrialCondition {
    const TABLE: &'static str = CONDITIONS_TABLE;
    const COLUMNS: &'static [&'static str] = &["eudract_number", "condition_name", "meddra_code"];

    fn cells(&self) -> Vec<Cell> {
        vec![
            Cell::Text(self.eudract_number.clone()),
            Cell::opt_text(self.condition_name.as_deref()),
            Cell::opt_text(self.meddra_code.as_deref()),
        ]
    }
}

/// Mapper output: one trial plus its child rows, all keyed by the trial's identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedRecord {
    pub trial: Trial,
    pub drugs: Vec<TrialDrug>,
    pub conditions: Vec<TrialCondition>,
}

impl ParsedRecord {
    pub fn identifier(&self) -> &str {
        &self.trial.eudract_number
    }
}

/// A persisted raw page as seen by a content store listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredDocument {
    pub key: String,
    pub modified_at: DateTime<Utc>,
}

impl StoredDocument {
    /// Key without its extension (`2004-000001-11.html` -> `2004-000001-11`).
    pub fn stem(&self) -> &str {
        match self.key.rsplit_once('.') {
            Some((stem, _)) if !stem.is_empty() => stem,
            _ => &self.key,
        }
    }
}

/// Companion `<id>.meta` record written next to every raw page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashSidecar {
    pub hash: String,
    pub source_tag: String,
    pub url: String,
    pub fetched_at: DateTime<Utc>,
}

impl HashSidecar {
    pub fn to_meta_text(&self) -> String {
        format!(
            "source_country={}\nurl={}\nfetched_at={}\nhash={}\n",
            self.source_tag,
            self.url,
            self.fetched_at.to_rfc3339(),
            self.hash
        )
    }

    /// Parse newline-delimited `key=value` text; `None` when any required key is missing.
    pub fn parse_meta_text(text: &str) -> Option<Self> {
        let mut hash = None;
        let mut source_tag = None;
        let mut url = None;
        let mut fetched_at = None;
        for line in text.lines() {
            let Some((k, v)) = line.split_once('=') else {
                continue;
            };
            let v = v.trim();
            match k.trim() {
                "hash" => hash = Some(v.to_string()),
                "source_country" => source_tag = Some(v.to_string()),
                "url" => url = Some(v.to_string()),
                "fetched_at" => {
                    fetched_at = DateTime::parse_from_rfc3339(v)
                        .ok()
                        .map(|ts| ts.with_timezone(&Utc))
                }
                _ => {}
            }
        }
        Some(Self {
            hash: hash.filter(|h| !h.is_empty())?,
            source_tag: source_tag?,
            url: url.unwrap_or_default(),
            fetched_at: fetched_at?,
        })
    }
}

/// Record key discovered on a search results page.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CandidateIdentifier {
    pub identifier: String,
    pub listed_on: Option<NaiveDate>,
}

/// One fully extracted search results page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HarvestedPage {
    pub page: u32,
    pub identifiers: Vec<CandidateIdentifier>,
}

impl HarvestedPage {
    pub fn max_listed_date(&self) -> Option<NaiveDate> {
        self.identifiers.iter().filter_map(|c| c.listed_on).max()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn sidecar_text_round_trips() {
        let sidecar = HashSidecar {
            hash: "abc123".into(),
            source_tag: "GB".into(),
            url: "https://example.test/trial/2004-000001-11/GB".into(),
            fetched_at: Utc.with_ymd_and_hms(2025, 3, 1, 9, 30, 0).unwrap(),
        };
        let parsed = HashSidecar::parse_meta_text(&sidecar.to_meta_text()).expect("parse");
        assert_eq!(parsed, sidecar);
    }

    #[test]
    fn sidecar_without_hash_is_rejected() {
        let text = "source_country=GB\nurl=x\nfetched_at=2025-03-01T09:30:00+00:00\n";
        assert!(HashSidecar::parse_meta_text(text).is_none());
        assert!(HashSidecar::parse_meta_text("garbage").is_none());
    }

    #[test]
    fn trial_cells_follow_column_order() {
        let trial = Trial {
            eudract_number: "2004-000001-11".into(),
            sponsor_name: Some("Acme".into()),
            trial_title: None,
            start_date: NaiveDate::from_ymd_opt(2004, 5, 6),
            trial_status: None,
            age_groups: Some(vec!["Adults".into()]),
            url_source: None,
            last_updated: None,
        };
        let cells = trial.cells();
        assert_eq!(cells.len(), Trial::COLUMNS.len());
        assert_eq!(cells[0], Cell::Text("2004-000001-11".into()));
        assert_eq!(cells[2], Cell::Null);
        assert_eq!(cells[3], Cell::Text("2004-05-06".into()));
        assert_eq!(cells[5], Cell::List(vec!["Adults".into()]));
    }

    #[test]
    fn document_stem_strips_extension() {
        let doc = StoredDocument {
            key: "2004-000001-11.html".into(),
            modified_at: Utc::now(),
        };
        assert_eq!(doc.stem(), "2004-000001-11");
    }

    #[test]
    fn page_max_listed_date_ignores_missing_dates() {
        let page = HarvestedPage {
            page: 1,
            identifiers: vec![
                CandidateIdentifier {
                    identifier: "A".into(),
                    listed_on: NaiveDate::from_ymd_opt(2023, 1, 2),
                },
                CandidateIdentifier {
                    identifier: "B".into(),
                    listed_on: None,
                },
                CandidateIdentifier {
                    identifier: "C".into(),
                    listed_on: NaiveDate::from_ymd_opt(2023, 4, 1),
                },
            ],
        };
        assert_eq!(page.max_listed_date(), NaiveDate::from_ymd_opt(2023, 4, 1));
    }
}
