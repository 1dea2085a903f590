//! Backend-neutral staging-to-target merge statements.

use super::LoadError;

/// Double-quoted SQL identifier with embedded quotes doubled.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Single-quoted SQL string literal.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Backquoted BigQuery identifier or dotted path.
pub fn quote_bigquery(path: &str) -> String {
    format!("`{}`", path.replace('\\', "\\\\").replace('`', "\\`"))
}

fn quoted_list(names: &[String]) -> String {
    names.iter().map(|n| quote_ident(n)).collect::<Vec<_>>().join(", ")
}

fn prefixed_list(alias: &str, names: &[String]) -> String {
    names
        .iter()
        .map(|n| format!("{alias}.{}", quote_ident(n)))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Column set and key predicate for merging one staging relation into its target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergePlan {
    target: String,
    staging: String,
    columns: Vec<String>,
    keys: Vec<String>,
}

impl MergePlan {
    /// Columns are the batch header restricted to what the staging relation actually has,
    /// in header order. Every conflict key must survive that restriction.
    pub fn new(
        target: &str,
        staging: &str,
        header: &[String],
        staging_columns: &[String],
        conflict_keys: &[&str],
    ) -> Result<Self, LoadError> {
        if conflict_keys.is_empty() {
            return Err(LoadError::Invalid(format!("no conflict keys for {target}")));
        }
        let columns: Vec<String> = header
            .iter()
            .filter(|c| staging_columns.contains(c))
            .cloned()
            .collect();
        if let Some(missing) = conflict_keys
            .iter()
            .find(|k| !columns.iter().any(|c| c == *k))
        {
            return Err(LoadError::Invalid(format!(
                "conflict key {missing} is not a loaded column of {target}"
            )));
        }

        Ok(Self {
            target: target.to_string(),
            staging: staging.to_string(),
            columns,
            keys: conflict_keys.iter().map(|k| k.to_string()).collect(),
        })
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    /// Non-key columns; empty means the merge only inserts.
    pub fn update_columns(&self) -> Vec<String> {
        self.columns
            .iter()
            .filter(|c| !self.keys.contains(c))
            .cloned()
            .collect()
    }

    fn null_safe_match(&self, left: &str, right: &str) -> String {
        self.keys
            .iter()
            .map(|k| {
                let k = quote_ident(k);
                format!("{left}.{k} IS NOT DISTINCT FROM {right}.{k}")
            })
            .collect::<Vec<_>>()
            .join(" AND ")
    }

    fn equal_or_both_null(&self, left: &str, right: &str) -> String {
        self.keys
            .iter()
            .map(|k| {
                let k = quote_ident(k);
                format!("({left}.{k} = {right}.{k} OR ({left}.{k} IS NULL AND {right}.{k} IS NULL))")
            })
            .collect::<Vec<_>>()
            .join(" AND ")
    }

    /// Single `MERGE` statement; the last staged row per key wins.
    pub fn postgres_merge_sql(&self) -> String {
        let cols = quoted_list(&self.columns);
        let keys = quoted_list(&self.keys);
        let mut sql = format!(
            "MERGE INTO {target} AS t USING (SELECT DISTINCT ON ({keys}) {cols} FROM {staging} ORDER BY {keys}, ctid DESC) AS s ON {on}",
            target = quote_ident(&self.target),
            staging = quote_ident(&self.staging),
            on = self.null_safe_match("t", "s"),
        );

        let updates = self.update_columns();
        if !updates.is_empty() {
            let assignments = updates
                .iter()
                .map(|c| format!("{0} = s.{0}", quote_ident(c)))
                .collect::<Vec<_>>()
                .join(", ");
            sql.push_str(&format!(" WHEN MATCHED THEN UPDATE SET {assignments}"));
        }
        sql.push_str(&format!(
            " WHEN NOT MATCHED THEN INSERT ({cols}) VALUES ({values})",
            values = prefixed_list("s", &self.columns),
        ));
        sql
    }

    /// BigQuery `MERGE`. `qualify` turns a table name into its backquoted path.
    /// One staged row per key survives; which one is unspecified.
    pub fn bigquery_merge_sql(&self, qualify: impl Fn(&str) -> String) -> String {
        let list = |alias: &str, names: &[String]| {
            names
                .iter()
                .map(|n| format!("{alias}{}", quote_bigquery(n)))
                .collect::<Vec<_>>()
                .join(", ")
        };
        let on = self
            .keys
            .iter()
            .map(|k| format!("t.{0} IS NOT DISTINCT FROM s.{0}", quote_bigquery(k)))
            .collect::<Vec<_>>()
            .join(" AND ");
        let mut sql = format!(
            "MERGE {target} AS t USING (SELECT {cols} FROM {staging} WHERE TRUE QUALIFY ROW_NUMBER() OVER (PARTITION BY {keys}) = 1) AS s ON {on}",
            target = qualify(&self.target),
            staging = qualify(&self.staging),
            cols = list("", &self.columns),
            keys = list("", &self.keys),
        );

        let updates = self.update_columns();
        if !updates.is_empty() {
            let assignments = updates
                .iter()
                .map(|c| format!("{0} = s.{0}", quote_bigquery(c)))
                .collect::<Vec<_>>()
                .join(", ");
            sql.push_str(&format!(" WHEN MATCHED THEN UPDATE SET {assignments}"));
        }
        sql.push_str(&format!(
            " WHEN NOT MATCHED THEN INSERT ({}) VALUES ({})",
            list("", &self.columns),
            list("s.", &self.columns),
        ));
        sql
    }

    /// Target rows replaced by the merge; `None` for an insert-only merge.
    pub fn delete_matching_sql(&self) -> Option<String> {
        if self.update_columns().is_empty() {
            return None;
        }
        Some(format!(
            "DELETE FROM {target} USING {staging} AS s WHERE {on}",
            target = quote_ident(&self.target),
            staging = quote_ident(&self.staging),
            on = self.equal_or_both_null(&quote_ident(&self.target), "s"),
        ))
    }

    /// One row per key from staging. Insert-only merges skip keys already in the target.
    pub fn insert_deduplicated_sql(&self) -> String {
        let cols = quoted_list(&self.columns);
        let keys = quoted_list(&self.keys);
        let mut sql = format!(
            "INSERT INTO {target} ({cols}) SELECT {cols} FROM (SELECT {cols}, ROW_NUMBER() OVER (PARTITION BY {keys} ORDER BY {keys}) AS \"__ctr_rank\" FROM {staging}) AS s WHERE s.\"__ctr_rank\" = 1",
            target = quote_ident(&self.target),
            staging = quote_ident(&self.staging),
        );
        if self.update_columns().is_empty() {
            sql.push_str(&format!(
                " AND NOT EXISTS (SELECT 1 FROM {target} AS t WHERE {on})",
                target = quote_ident(&self.target),
                on = self.equal_or_both_null("t", "s"),
            ));
        }
        sql
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn identifiers_and_literals_are_quoted() {
        assert_eq!(quote_ident("select"), "\"select\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(quote_literal("it's"), "'it''s'");
    }

    #[test]
    fn header_drift_is_dropped_and_keys_validated() {
        let plan = MergePlan::new(
            "eu_trials",
            "eu_trials_staging_1",
            &cols(&["eudract_number", "sponsor_name", "extra"]),
            &cols(&["eudract_number", "sponsor_name", "trial_title"]),
            &["eudract_number"],
        )
        .expect("plan");
        assert_eq!(plan.columns(), cols(&["eudract_number", "sponsor_name"]).as_slice());

        let err = MergePlan::new(
            "eu_trials",
            "s",
            &cols(&["sponsor_name"]),
            &cols(&["eudract_number", "sponsor_name"]),
            &["eudract_number"],
        )
        .expect_err("missing key");
        assert!(matches!(err, LoadError::Invalid(_)));

        assert!(MergePlan::new("t", "s", &cols(&["a"]), &cols(&["a"]), &[]).is_err());
    }

    #[test]
    fn postgres_merge_updates_non_key_columns() {
        let plan = MergePlan::new(
            "eu_trials",
            "stg",
            &cols(&["id", "sponsor"]),
            &cols(&["id", "sponsor"]),
            &["id"],
        )
        .expect("plan");
        assert_eq!(
            plan.postgres_merge_sql(),
            "MERGE INTO \"eu_trials\" AS t USING (SELECT DISTINCT ON (\"id\") \"id\", \"sponsor\" FROM \"stg\" ORDER BY \"id\", ctid DESC) AS s \
             ON t.\"id\" IS NOT DISTINCT FROM s.\"id\" \
             WHEN MATCHED THEN UPDATE SET \"sponsor\" = s.\"sponsor\" \
             WHEN NOT MATCHED THEN INSERT (\"id\", \"sponsor\") VALUES (s.\"id\", s.\"sponsor\")"
        );
    }

    #[test]
    fn key_only_merge_degrades_to_insert_only() {
        let plan = MergePlan::new(
            "eu_trial_conditions",
            "stg",
            &cols(&["eudract_number", "condition_name"]),
            &cols(&["id", "eudract_number", "condition_name"]),
            &["eudract_number", "condition_name"],
        )
        .expect("plan");
        assert!(plan.update_columns().is_empty());
        assert!(!plan.postgres_merge_sql().contains("WHEN MATCHED"));
        assert!(plan.delete_matching_sql().is_none());
        assert!(plan.insert_deduplicated_sql().contains("NOT EXISTS"));
    }

    #[test]
    fn delete_then_insert_form_matches_nulls() {
        let plan = MergePlan::new(
            "eu_trial_drugs",
            "stg",
            &cols(&["eudract_number", "drug_name", "cas_number"]),
            &cols(&["eudract_number", "drug_name", "cas_number"]),
            &["eudract_number", "drug_name"],
        )
        .expect("plan");
        let delete = plan.delete_matching_sql().expect("has updates");
        assert!(delete.starts_with("DELETE FROM \"eu_trial_drugs\" USING \"stg\" AS s WHERE "));
        assert!(delete.contains(
            "(\"eu_trial_drugs\".\"drug_name\" = s.\"drug_name\" OR (\"eu_trial_drugs\".\"drug_name\" IS NULL AND s.\"drug_name\" IS NULL))"
        ));
        let insert = plan.insert_deduplicated_sql();
        assert!(insert.contains("ROW_NUMBER() OVER (PARTITION BY \"eudract_number\", \"drug_name\""));
        assert!(!insert.contains("NOT EXISTS"));
    }

    #[test]
    fn bigquery_merge_uses_backquoted_paths() {
        assert_eq!(quote_bigquery("p.d.eu_trials"), "`p.d.eu_trials`");
        assert_eq!(quote_bigquery("we`ird"), "`we\\`ird`");

        let plan = MergePlan::new(
            "eu_trials",
            "stg",
            &cols(&["id", "sponsor"]),
            &cols(&["id", "sponsor", "last_updated"]),
            &["id"],
        )
        .expect("plan");
        assert_eq!(
            plan.bigquery_merge_sql(|t| quote_bigquery(&format!("proj.eu_ctr.{t}"))),
            "MERGE `proj.eu_ctr.eu_trials` AS t USING (SELECT `id`, `sponsor` FROM `proj.eu_ctr.stg` \
             WHERE TRUE QUALIFY ROW_NUMBER() OVER (PARTITION BY `id`) = 1) AS s \
             ON t.`id` IS NOT DISTINCT FROM s.`id` \
             WHEN MATCHED THEN UPDATE SET `sponsor` = s.`sponsor` \
             WHEN NOT MATCHED THEN INSERT (`id`, `sponsor`) VALUES (s.`id`, s.`sponsor`)"
        );
    }
}
