//! Header-first CSV row sets handed to a [`crate::loader::Loader`].

use std::collections::HashSet;

use ctr_core::{Cell, TableRow};

/// Serialized rows for one target table, duplicates coalesced, first-seen order kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadBatch {
    table: String,
    columns: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl LoadBatch {
    pub fn new(table: impl Into<String>, columns: Vec<String>) -> Self {
        Self {
            table: table.into(),
            columns,
            rows: Vec::new(),
        }
    }

    pub fn from_rows<R: TableRow>(records: &[R]) -> Self {
        let mut batch = Self::new(
            R::TABLE,
            R::COLUMNS.iter().map(|c| c.to_string()).collect(),
        );
        batch.extend(records.iter().map(|r| r.cells()));
        batch
    }

    /// Append rows given as cells; rows equal to an earlier one after encoding are dropped.
    pub fn extend(&mut self, rows: impl IntoIterator<Item = Vec<Cell>>) {
        let mut seen: HashSet<Vec<String>> = self.rows.iter().cloned().collect();
        for cells in rows {
            let encoded: Vec<String> = cells.iter().map(encode_cell).collect();
            if seen.insert(encoded.clone()) {
                self.rows.push(encoded);
            }
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<String>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Same rows restricted to `columns` (in that order); unknown names are skipped.
    pub fn project(&self, columns: &[String]) -> LoadBatch {
        let picks: Vec<(String, usize)> = columns
            .iter()
            .filter_map(|c| self.columns.iter().position(|own| own == c).map(|i| (c.clone(), i)))
            .collect();
        let mut projected = LoadBatch::new(
            self.table.clone(),
            picks.iter().map(|(name, _)| name.clone()).collect(),
        );
        let mut seen = HashSet::new();
        for row in &self.rows {
            let narrowed: Vec<String> = picks.iter().map(|(_, i)| row[*i].clone()).collect();
            if seen.insert(narrowed.clone()) {
                projected.rows.push(narrowed);
            }
        }
        projected
    }

    /// Rows laid out in exactly `columns` order for positional loaders.
    /// Columns the batch lacks are left empty, which loads as NULL.
    pub fn align(&self, columns: &[String]) -> LoadBatch {
        let picks: Vec<Option<usize>> = columns
            .iter()
            .map(|c| self.columns.iter().position(|own| own == c))
            .collect();
        let mut aligned = LoadBatch::new(self.table.clone(), columns.to_vec());
        aligned.rows = self
            .rows
            .iter()
            .map(|row| {
                picks
                    .iter()
                    .map(|pick| pick.map(|i| row[i].clone()).unwrap_or_default())
                    .collect()
            })
            .collect();
        aligned
    }

    /// RFC 4180 CSV: header line, then one record per row, quoting only where needed.
    pub fn to_csv(&self) -> Result<Vec<u8>, csv::Error> {
        let mut writer = csv::WriterBuilder::new()
            .quote_style(csv::QuoteStyle::Necessary)
            .terminator(csv::Terminator::Any(b'\n'))
            .from_writer(Vec::new());
        writer.write_record(&self.columns)?;
        for row in &self.rows {
            writer.write_record(row)?;
        }
        writer.flush()?;
        writer
            .into_inner()
            .map_err(|err| csv::Error::from(err.into_error()))
    }
}

/// Field text for one cell; `Null` is the empty field.
pub fn encode_cell(cell: &Cell) -> String {
    match cell {
        Cell::Null => String::new(),
        Cell::Text(text) => text.clone(),
        Cell::List(items) => array_literal(items),
    }
}

/// `{"a","b"}` with backslash escaping of embedded quotes and backslashes.
pub fn array_literal(items: &[String]) -> String {
    let quoted: Vec<String> = items
        .iter()
        .map(|item| format!("\"{}\"", item.replace('\\', "\\\\").replace('"', "\\\"")))
        .collect();
    format!("{{{}}}", quoted.join(","))
}
