use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use ctr_adapters::{LabelMapper, RecordMapper, SearchResultParser};

fn fixture_path(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures/euctr")
        .join(name)
}

fn read_fixture(name: &str) -> String {
    std::fs::read_to_string(fixture_path(name)).expect("fixture readable")
}

#[test]
fn trial_fixture_maps_to_trial_drugs_and_conditions() {
    let mapper = LabelMapper::new().expect("mapper");
    let url = "https://www.clinicaltrialsregister.eu/ctr-search/trial/2004-000015-25/3rd";
    let record = mapper
        .map_document(&read_fixture("trial_2004-000015-25.html"), url)
        .expect("fixture maps");

    let trial = &record.trial;
    assert_eq!(trial.eudract_number, "2004-000015-25");
    assert_eq!(trial.sponsor_name.as_deref(), Some("Example Pharma GmbH"));
    assert_eq!(
        trial.trial_title.as_deref(),
        Some("A randomised, double-blind study of Examplumab in adults with chronic fatigue")
    );
    assert_eq!(trial.start_date, NaiveDate::from_ymd_opt(2004, 6, 7));
    assert_eq!(trial.trial_status.as_deref(), Some("Completed"));
    assert_eq!(
        trial.age_groups,
        Some(vec!["Adults".to_string(), "Elderly".to_string()])
    );
    assert_eq!(trial.url_source.as_deref(), Some(url));
    assert_eq!(trial.last_updated, None);

    assert_eq!(record.drugs.len(), 2);
    let active = &record.drugs[0];
    assert_eq!(active.drug_name.as_deref(), Some("Examplix"));
    assert_eq!(active.active_ingredient.as_deref(), Some("EXAMPLUMAB"));
    assert_eq!(active.pharmaceutical_form.as_deref(), Some("Solution for injection"));
    assert_eq!(active.cas_number.as_deref(), Some("123456-78-9"));
    let placebo = &record.drugs[1];
    assert_eq!(placebo.drug_name.as_deref(), Some("Placebo"));
    assert_eq!(placebo.active_ingredient, None);

    assert_eq!(record.conditions.len(), 1);
    assert_eq!(
        record.conditions[0].condition_name.as_deref(),
        Some("Chronic fatigue syndrome")
    );
    assert_eq!(record.conditions[0].meddra_code.as_deref(), Some("20.0 / LLT"));
}

#[test]
fn search_fixture_lists_identifiers_in_page_order() {
    let parser = SearchResultParser::new().expect("parser");
    let found = parser.extract(&read_fixture("search_page.html"));

    let ids: Vec<_> = found.iter().map(|c| c.identifier.as_str()).collect();
    assert_eq!(ids, vec!["2004-000015-25", "2011-005696-17", "2015-001234-56"]);
    assert_eq!(found[0].listed_on, NaiveDate::from_ymd_opt(2004, 6, 7));
    assert_eq!(found[1].listed_on, NaiveDate::from_ymd_opt(2012, 2, 14));
    assert_eq!(found[2].listed_on, None);
}
