//! Tabular dataset read from and written to CSV
//!
//! Rows are stored as string cells aligned with the header row. Short input
//! rows are padded with empty cells; cells beyond the header row get
//! `Unnamed: <index>` headers so every row has one cell per column.

use crate::error::{Error, Result};
use crate::types::Key;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// One dataset row; cells are aligned with [`Dataset::headers`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetRow {
    cells: Vec<String>,
}

impl DatasetRow {
    pub fn new(cells: Vec<String>) -> Self {
        Self { cells }
    }

    pub fn cells(&self) -> &[String] {
        &self.cells
    }

    pub fn get(&self, column: usize) -> Option<&str> {
        self.cells.get(column).map(String::as_str)
    }

    pub fn set(&mut self, column: usize, value: impl Into<String>) {
        if column >= self.cells.len() {
            self.cells.resize(column + 1, String::new());
        }
        self.cells[column] = value.into();
    }

    /// Missing or whitespace-only
    pub fn is_blank(&self, column: usize) -> bool {
        self.get(column).map_or(true, |v| v.trim().is_empty())
    }
}

/// Header row plus data rows
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dataset {
    headers: Vec<String>,
    rows: Vec<DatasetRow>,
}

impl Dataset {
    pub fn new(mut headers: Vec<String>, rows: Vec<Vec<String>>) -> Self {
        let widest = rows.iter().map(Vec::len).max().unwrap_or(0);
        if widest > headers.len() {
            tracing::warn!(
                columns = headers.len(),
                widest_row = widest,
                "Rows longer than the header row, naming the extra columns"
            );
            for idx in headers.len()..widest {
                headers.push(format!("Unnamed: {}", idx));
            }
        }

        let width = headers.len();
        let rows = rows
            .into_iter()
            .map(|mut cells| {
                cells.resize(width, String::new());
                DatasetRow::new(cells)
            })
            .collect();
        Self { headers, rows }
    }

    /// Read a CSV file with a header row
    pub fn read_csv(path: &Path) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new().flexible(true).from_path(path)?;

        let headers: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
        if headers.is_empty() || headers.iter().all(|h| h.trim().is_empty()) {
            return Err(Error::InvalidDataset(format!(
                "{} has no header row",
                path.display()
            )));
        }

        let mut rows = Vec::new();
        for result in reader.records() {
            let record = result?;
            rows.push(record.iter().map(str::to_string).collect());
        }

        Ok(Self::new(headers, rows))
    }

    /// Write as CSV via a temp file renamed into place
    pub fn write_csv(&self, path: &Path) -> Result<()> {
        let tmp = temp_path_for(path);
        {
            let mut writer = csv::WriterBuilder::new().flexible(true).from_path(&tmp)?;
            writer.write_record(&self.headers)?;
            for row in &self.rows {
                writer.write_record(row.cells())?;
            }
            writer.flush()?;
        }
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn rows(&self) -> &[DatasetRow] {
        &self.rows
    }

    pub fn rows_mut(&mut self) -> &mut [DatasetRow] {
        &mut self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h.trim() == name.trim())
    }

    /// Index of the key column, or an error naming the missing column
    pub fn key_column_index(&self, name: &str) -> Result<usize> {
        self.column_index(name).ok_or_else(|| {
            Error::InvalidDataset(format!("No '{}' column found in dataset", name))
        })
    }

    /// Index of `name`, appending an empty column when absent
    pub fn ensure_column(&mut self, name: &str) -> usize {
        if let Some(idx) = self.column_index(name) {
            return idx;
        }
        self.headers.push(name.to_string());
        let width = self.headers.len();
        for row in &mut self.rows {
            row.cells.resize(width, String::new());
        }
        width - 1
    }

    /// Key of `row`, when non-blank
    pub fn key_of(&self, row: &DatasetRow, key_column: usize) -> Option<Key> {
        row.get(key_column).and_then(Key::parse)
    }

    /// Distinct non-blank keys in first-seen order
    pub fn distinct_keys(&self, key_column: &str) -> Result<Vec<Key>> {
        let idx = self.key_column_index(key_column)?;
        let mut seen = HashSet::new();
        Ok(self
            .rows
            .iter()
            .filter_map(|row| self.key_of(row, idx))
            .filter(|key| seen.insert(key.clone()))
            .collect())
    }

    /// Keep the first row per key; rows with a blank key are always kept
    ///
    /// Returns the removed rows' keys in the order they were dropped.
    pub fn deduplicate_by_key(&mut self, key_column: &str) -> Result<Vec<Key>> {
        let idx = self.key_column_index(key_column)?;
        let mut seen = HashSet::new();
        let mut removed = Vec::new();

        let rows = std::mem::take(&mut self.rows);
        for row in rows {
            match row.get(idx).and_then(Key::parse) {
                Some(key) if !seen.insert(key.clone()) => removed.push(key),
                _ => self.rows.push(row),
            }
        }
        Ok(removed)
    }
}

fn temp_path_for(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("dataset");
    path.with_file_name(format!(".{}.tmp.{}", file_name, std::process::id()))
}

/// Copy `path` to `<stem>_<label>_<YYYYmmdd_HHMMSS>.<ext>` beside it
pub fn backup_file(path: &Path, label: &str) -> Result<PathBuf> {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("dataset");
    let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    let file_name = match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{}_{}_{}.{}", stem, label, timestamp, ext),
        None => format!("{}_{}_{}", stem, label, timestamp),
    };
    let backup = path.with_file_name(file_name);
    std::fs::copy(path, &backup)?;
    Ok(backup)
}
