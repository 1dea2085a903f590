//! Register-specific HTML knowledge: trial page mapping and search-result identifier extraction.

use chrono::NaiveDate;
use ctr_core::{CandidateIdentifier, ParsedRecord, Trial, TrialCondition, TrialDrug};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;

pub const CRATE_NAME: &str = "ctr-adapters";

const IDENTIFIER_LABEL: &str = "EudraCT Number";

const DRUG_LABELS: &[&str] = &[
    "Trade name",
    "Name of Active Substance",
    "Active Substance",
    "Product Name",
    "Pharmaceutical form",
];

const CONDITION_LABELS: &[&str] = &["Medical condition", "MedDRA version", "MedDRA level"];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%d/%m/%Y", "%d.%m.%Y"];

#[derive(Debug, Error)]
pub enum MapError {
    #[error("could not find an EudraCT number in the document")]
    NoIdentifier,
    #[error("unrecognised date {value:?}")]
    InvalidDate { value: String },
    #[error("invalid selector: {0}")]
    Selector(String),
    #[error("invalid pattern: {0}")]
    Pattern(#[from] regex::Error),
}

/// Raw trial document in, one trial plus its child rows out.
pub trait RecordMapper: Send + Sync {
    fn map_document(&self, content: &str, source_url: &str) -> Result<ParsedRecord, MapError>;
}

/// Collapse whitespace runs (including non-breaking spaces) to single spaces.
pub fn clean_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn text_or_none(value: String) -> Option<String> {
    let cleaned = clean_text(&value);
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned)
    }
}

fn element_text(element: ElementRef<'_>) -> Option<String> {
    text_or_none(element.text().collect::<Vec<_>>().join(" "))
}

fn selector(css: &str) -> Result<Selector, MapError> {
    Selector::parse(css).map_err(|e| MapError::Selector(e.to_string()))
}

/// Accepts `YYYY-MM-DD`, `DD/MM/YYYY` and `DD.MM.YYYY`.
pub fn parse_flexible_date(value: &str) -> Result<NaiveDate, MapError> {
    let trimmed = value.trim();
    DATE_FORMATS
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(trimmed, format).ok())
        .ok_or_else(|| MapError::InvalidDate {
            value: trimmed.to_string(),
        })
}

/// Parent element of the first text node containing `label` (case-insensitive).
fn find_label_element<'a>(root: ElementRef<'a>, label: &str) -> Option<ElementRef<'a>> {
    let needle = label.to_lowercase();
    root.descendants()
        .filter(|node| {
            node.value()
                .as_text()
                .is_some_and(|text| text.to_lowercase().contains(&needle))
        })
        .find_map(|node| node.parent().and_then(ElementRef::wrap))
}

fn next_sibling_element(element: ElementRef<'_>) -> Option<ElementRef<'_>> {
    element.next_siblings().find_map(ElementRef::wrap)
}

/// Value cell for `label`: the element following the label's container.
///
/// Labels wrapped in inline markup (`<td><b>Label</b></td>`) are looked up one level higher.
pub fn field_by_label(root: ElementRef<'_>, label: &str) -> Option<String> {
    let mut container = find_label_element(root, label)?;
    let mut value = next_sibling_element(container);

    if value.is_none() && matches!(container.value().name(), "b" | "span" | "strong" | "font") {
        if let Some(outer) = container.parent().and_then(ElementRef::wrap) {
            container = outer;
            value = next_sibling_element(container);
        }
    }

    value.and_then(element_text)
}

fn first_field(root: ElementRef<'_>, labels: &[&str]) -> Option<String> {
    labels.iter().find_map(|label| field_by_label(root, label))
}

fn enclosing_table(element: ElementRef<'_>) -> Option<ElementRef<'_>> {
    if element.value().name() == "table" {
        return Some(element);
    }
    element
        .ancestors()
        .filter_map(ElementRef::wrap)
        .find(|e| e.value().name() == "table")
}

/// Distinct nearest tables holding any of `labels`, in document order.
fn tables_with_labels<'a>(root: ElementRef<'a>, labels: &[&str]) -> Vec<ElementRef<'a>> {
    let needles: Vec<String> = labels.iter().map(|l| l.to_lowercase()).collect();
    let mut tables: Vec<ElementRef<'a>> = Vec::new();

    for node in root.descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let lowered = text.to_lowercase();
        if !needles.iter().any(|n| lowered.contains(n.as_str())) {
            continue;
        }
        let Some(table) = node
            .parent()
            .and_then(ElementRef::wrap)
            .and_then(enclosing_table)
        else {
            continue;
        };
        if !tables.iter().any(|t| t.id() == table.id()) {
            tables.push(table);
        }
    }
    tables
}

/// Label-driven mapper for register trial pages.
#[derive(Debug, Clone)]
pub struct LabelMapper {
    age_code: Regex,
    parenthetical: Regex,
    row: Selector,
    cell: Selector,
}

impl LabelMapper {
    pub fn new() -> Result<Self, MapError> {
        Ok(Self {
            age_code: Regex::new(r"^F\.1(\.\d+)*\.?$")?,
            parenthetical: Regex::new(r"\([^)]*\)")?,
            row: selector("tr")?,
            cell: selector("td, th")?,
        })
    }

    fn parse_trial(&self, root: ElementRef<'_>, source_url: &str) -> Result<Trial, MapError> {
        let eudract_number = field_by_label(root, IDENTIFIER_LABEL).ok_or(MapError::NoIdentifier)?;

        let start_date = first_field(
            root,
            &["Date of Competent Authority Decision", "Date record first entered"],
        )
        .map(|raw| parse_flexible_date(&raw))
        .transpose()?;

        Ok(Trial {
            eudract_number,
            sponsor_name: field_by_label(root, "Name of Sponsor"),
            trial_title: first_field(
                root,
                &["Full title of the trial", "Title of the trial for lay people"],
            ),
            start_date,
            trial_status: first_field(root, &["Trial Status", "Status of the trial"]),
            age_groups: self.parse_age_groups(root),
            url_source: Some(source_url.to_string()).filter(|u| !u.is_empty()),
            last_updated: None,
        })
    }

    fn parse_drugs(&self, root: ElementRef<'_>, eudract_number: &str) -> Vec<TrialDrug> {
        tables_with_labels(root, DRUG_LABELS)
            .into_iter()
            .filter_map(|table| {
                let drug = TrialDrug {
                    eudract_number: eudract_number.to_string(),
                    drug_name: first_field(table, &["Trade name", "Product Name"]),
                    active_ingredient: first_field(
                        table,
                        &["Name of Active Substance", "Active Substance"],
                    ),
                    pharmaceutical_form: field_by_label(table, "Pharmaceutical form"),
                    cas_number: field_by_label(table, "CAS Number"),
                };
                let any_field = drug.drug_name.is_some()
                    || drug.active_ingredient.is_some()
                    || drug.pharmaceutical_form.is_some()
                    || drug.cas_number.is_some();
                any_field.then_some(drug)
            })
            .collect()
    }

    fn parse_conditions(&self, root: ElementRef<'_>, eudract_number: &str) -> Vec<TrialCondition> {
        tables_with_labels(root, CONDITION_LABELS)
            .into_iter()
            .filter_map(|table| {
                let condition_name = field_by_label(table, "Medical condition");
                let meddra_code = match (
                    field_by_label(table, "MedDRA version"),
                    field_by_label(table, "MedDRA level"),
                ) {
                    (Some(version), Some(level)) => Some(format!("{version} / {level}")),
                    (version, level) => version.or(level),
                };
                if condition_name.is_none() && meddra_code.is_none() {
                    return None;
                }
                Some(TrialCondition {
                    eudract_number: eudract_number.to_string(),
                    condition_name,
                    meddra_code,
                })
            })
            .collect()
    }

    /// Rows shaped `F.1.x | <group> | Yes`; sorted, de-duplicated, `None` when nothing is ticked.
    fn parse_age_groups(&self, root: ElementRef<'_>) -> Option<Vec<String>> {
        let mut groups: Vec<String> = Vec::new();
        for row in root.select(&self.row) {
            let cells: Vec<String> = row
                .select(&self.cell)
                .map(|cell| element_text(cell).unwrap_or_default())
                .collect();
            if cells.len() < 3 || !self.age_code.is_match(&cells[0]) {
                continue;
            }
            if !cells[cells.len() - 1].eq_ignore_ascii_case("yes") {
                continue;
            }
            let group = clean_text(&self.parenthetical.replace_all(&cells[1], ""));
            if !group.is_empty() {
                groups.push(group);
            }
        }
        groups.sort();
        groups.dedup();
        (!groups.is_empty()).then_some(groups)
    }
}

impl RecordMapper for LabelMapper {
    fn map_document(&self, content: &str, source_url: &str) -> Result<ParsedRecord, MapError> {
        let document = Html::parse_document(content);
        let root = document.root_element();

        let trial = self.parse_trial(root, source_url)?;
        let drugs = self.parse_drugs(root, &trial.eudract_number);
        let conditions = self.parse_conditions(root, &trial.eudract_number);

        Ok(ParsedRecord {
            trial,
            drugs,
            conditions,
        })
    }
}

/// Pulls candidate identifiers (and their listed start dates) out of a search-result page.
#[derive(Debug, Clone)]
pub struct SearchResultParser {
    identifier: Regex,
    start_date: Regex,
}

impl SearchResultParser {
    pub fn new() -> Result<Self, MapError> {
        Ok(Self {
            identifier: Regex::new(r"EudraCT Number:\s*([0-9A-Za-z][0-9A-Za-z-]*)")?,
            start_date: Regex::new(r"Start Date\*?:\s*(\S+)")?,
        })
    }

    pub fn extract(&self, html: &str) -> Vec<CandidateIdentifier> {
        let document = Html::parse_document(html);
        let text = document
            .root_element()
            .text()
            .collect::<Vec<_>>()
            .join(" ");
        self.extract_from_text(&text)
    }

    fn extract_from_text(&self, text: &str) -> Vec<CandidateIdentifier> {
        let matches: Vec<_> = self.identifier.captures_iter(text).collect();
        let mut found: Vec<CandidateIdentifier> = Vec::new();

        for (index, captures) in matches.iter().enumerate() {
            let (Some(whole), Some(token)) = (captures.get(0), captures.get(1)) else {
                continue;
            };
            let identifier = token.as_str().trim_end_matches(['.', ',']);
            if identifier.is_empty() || found.iter().any(|c| c.identifier == identifier) {
                continue;
            }

            let segment_end = matches
                .get(index + 1)
                .and_then(|next| next.get(0))
                .map_or(text.len(), |m| m.start());
            let listed_on = self
                .start_date
                .captures(&text[whole.end()..segment_end])
                .and_then(|c| c.get(1))
                .and_then(|m| parse_flexible_date(m.as_str().trim_end_matches(['.', ','])).ok());

            found.push(CandidateIdentifier {
                identifier: identifier.to_string(),
                listed_on,
            });
        }
        found
    }
}
