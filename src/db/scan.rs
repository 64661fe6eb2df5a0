//! Result cursors and row-to-structure mapping.
//!
//! Rows are mapped onto caller types through serde: each [`Record`] is
//! deserialized into the target, so any `Deserialize` struct whose field
//! names match the selected columns can be scanned. A record with a single
//! column can also be scanned straight into a scalar.

use crate::db::types::Record;
use crate::error::{DbError, DbResult};
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;

/// Forward-only cursor over a materialised result set.
#[derive(Debug, Default)]
pub struct Rows {
    columns: Vec<String>,
    records: std::vec::IntoIter<Record>,
}

impl Rows {
    pub fn from_records(columns: Vec<String>, records: Vec<Record>) -> Self {
        Self {
            columns,
            records: records.into_iter(),
        }
    }

    /// Column names in select order. Empty when the result set has no rows.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }
}

impl Iterator for Rows {
    type Item = Record;

    fn next(&mut self) -> Option<Record> {
        self.records.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.records.size_hint()
    }
}

impl ExactSizeIterator for Rows {}

/// Cursor over at most one row, as returned by `query_row`.
///
/// Failures of the statement itself are deferred until the row is read.
#[derive(Debug)]
pub struct Row {
    query: String,
    result: DbResult<Rows>,
}

impl Row {
    pub fn new(query: impl Into<String>, result: DbResult<Rows>) -> Self {
        Self {
            query: query.into(),
            result,
        }
    }

    /// The deferred statement error, if any.
    pub fn err(&self) -> Option<&DbError> {
        self.result.as_ref().err()
    }

    /// The first row. Additional rows are ignored.
    pub fn into_record(self) -> DbResult<Record> {
        let Row { query, result } = self;
        result?.next().ok_or_else(|| DbError::not_found(query))
    }

    pub fn scan<T: DeserializeOwned>(self) -> DbResult<T> {
        let query = self.query.clone();
        let record = self.into_record()?;
        scan_record(&query, record)
    }
}

/// Map exactly one row onto `T`.
///
/// Fails with `NotFound` for an empty cursor and `MultipleRows` when more
/// than one row is left.
pub fn scan_one<T: DeserializeOwned>(query: &str, mut rows: Rows) -> DbResult<T> {
    match rows.len() {
        0 => Err(DbError::not_found(query)),
        1 => {
            let record = rows.next().ok_or_else(|| DbError::not_found(query))?;
            scan_record(query, record)
        }
        count => Err(DbError::multiple_rows(query, count)),
    }
}

/// Map every remaining row onto `T`.
pub fn scan_all<T: DeserializeOwned>(query: &str, rows: Rows) -> DbResult<Vec<T>> {
    rows.map(|record| scan_record(query, record)).collect()
}

pub fn scan_record<T: DeserializeOwned>(query: &str, record: Record) -> DbResult<T> {
    let value = JsonValue::Object(record);
    match T::deserialize(&value) {
        Ok(v) => Ok(v),
        Err(err) => single_column(&value)
            .and_then(|column| T::deserialize(column).ok())
            .ok_or_else(|| DbError::scan_failed(query, err.to_string())),
    }
}

fn single_column(value: &JsonValue) -> Option<&JsonValue> {
    match value {
        JsonValue::Object(map) if map.len() == 1 => map.values().next(),
        _ => None,
    }
}
