//! File-backed snapshot sources.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use calamine::{open_workbook_auto, Data, Reader};
use serde_json::{Number, Value};
use stock_ledger_core::{RawRow, SnapshotSource, SourceError};

/// Reads the first worksheet of an XLSX/XLS/ODS workbook. Row 1 holds column names.
#[derive(Debug, Clone)]
pub struct WorkbookSource {
    path: PathBuf,
}

impl WorkbookSource {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl SnapshotSource for WorkbookSource {
    fn describe(&self) -> String {
        format!("workbook:{}", self.path.display())
    }

    fn fetch(&self) -> Result<Vec<RawRow>, SourceError> {
        ensure_exists(&self.path)?;
        let mut workbook = open_workbook_auto(&self.path)
            .map_err(|err| SourceError::Unreadable(format!("{}: {err}", self.path.display())))?;

        let Some(sheet_name) = workbook.sheet_names().first().cloned() else {
            return Err(SourceError::Unreadable(format!(
                "{}: workbook has no sheets",
                self.path.display()
            )));
        };
        let range = workbook
            .worksheet_range(&sheet_name)
            .map_err(|err| SourceError::Unreadable(format!("sheet `{sheet_name}`: {err}")))?;

        let mut rows = range.rows();
        let Some(header) = rows.next() else {
            return Ok(Vec::new());
        };
        let columns = header.iter().map(cell_to_value).map(header_name).collect::<Vec<_>>();

        let mut snapshot = Vec::new();
        for row in rows {
            if row.iter().all(|cell| matches!(cell, Data::Empty)) {
                continue;
            }
            let raw = columns
                .iter()
                .zip(row.iter())
                .filter(|(column, _)| !column.is_empty())
                .map(|(column, cell)| (column.clone(), cell_to_value(cell)))
                .collect::<RawRow>();
            snapshot.push(raw);
        }

        tracing::debug!(source = %self.describe(), rows = snapshot.len(), "read workbook snapshot");
        Ok(snapshot)
    }
}

/// Reads a JSON array of row objects keyed by column name.
#[derive(Debug, Clone)]
pub struct JsonFileSource {
    path: PathBuf,
}

impl JsonFileSource {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl SnapshotSource for JsonFileSource {
    fn describe(&self) -> String {
        format!("json:{}", self.path.display())
    }

    fn fetch(&self) -> Result<Vec<RawRow>, SourceError> {
        let content = std::fs::read_to_string(&self.path).map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                SourceError::NotFound(self.path.display().to_string())
            } else {
                SourceError::Unreadable(format!("{}: {err}", self.path.display()))
            }
        })?;
        serde_json::from_str::<Vec<RawRow>>(&content)
            .map_err(|err| SourceError::Unreadable(format!("{}: {err}", self.path.display())))
    }
}

fn ensure_exists(path: &Path) -> Result<(), SourceError> {
    if path.exists() {
        Ok(())
    } else {
        Err(SourceError::NotFound(path.display().to_string()))
    }
}

fn header_name(value: Value) -> String {
    match value {
        Value::String(text) => text.trim().to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn cell_to_value(cell: &Data) -> Value {
    match cell {
        Data::Empty => Value::Null,
        Data::String(text) => Value::String(text.clone()),
        Data::Float(number) => Number::from_f64(*number).map_or(Value::Null, Value::Number),
        Data::Int(number) => Value::from(*number),
        Data::Bool(flag) => Value::Bool(*flag),
        Data::Error(err) => Value::String(format!("#ERROR: {err:?}")),
        Data::DateTime(date_time) => Value::String(date_time.to_string()),
        Data::DateTimeIso(text) | Data::DurationIso(text) => Value::String(text.clone()),
    }
}
