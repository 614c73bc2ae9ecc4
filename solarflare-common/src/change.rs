//! wal2json change records and their decoding
//!
//! A raw record carries index-aligned column names and values (or the old
//! key names and values for deletes). Decoding zips them into a [`Row`] and
//! narrows the record kind to the three kinds that carry row data.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error};

use crate::error::{Error, Result};
use crate::types::{Row, TableRef};

/// Every kind wal2json can emit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RawKind {
    Insert,
    Update,
    Delete,
    Truncate,
    Message,
}

/// Replica identity of a deleted row
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OldKeys {
    pub keynames: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keytypes: Vec<String>,
    pub keyvalues: Vec<Value>,
}

/// A single wal2json (format-version 1) change record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawChange {
    pub kind: RawKind,
    #[serde(default)]
    pub schema: String,
    #[serde(default)]
    pub table: String,
    #[serde(default)]
    pub columnnames: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub columntypes: Vec<String>,
    #[serde(default)]
    pub columnvalues: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oldkeys: Option<OldKeys>,
}

/// One wal2json transaction as returned by the replication slot
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Wal2JsonTransaction {
    #[serde(default)]
    pub change: Vec<RawChange>,
}

impl RawChange {
    pub fn table_ref(&self) -> TableRef {
        TableRef::new(&self.schema, &self.table)
    }

    /// Build an insert record from a row
    pub fn insert(table: &TableRef, row: &Row) -> Self {
        Self::with_columns(RawKind::Insert, table, row)
    }

    /// Build an update record from the new row
    pub fn update(table: &TableRef, row: &Row) -> Self {
        Self::with_columns(RawKind::Update, table, row)
    }

    /// Build a delete record from the old key columns
    pub fn delete(table: &TableRef, keys: &Row) -> Self {
        Self {
            kind: RawKind::Delete,
            schema: table.schema.clone(),
            table: table.name.clone(),
            columnnames: Vec::new(),
            columntypes: Vec::new(),
            columnvalues: Vec::new(),
            oldkeys: Some(OldKeys {
                keynames: keys.keys().cloned().collect(),
                keytypes: Vec::new(),
                keyvalues: keys.values().cloned().collect(),
            }),
        }
    }

    fn with_columns(kind: RawKind, table: &TableRef, row: &Row) -> Self {
        Self {
            kind,
            schema: table.schema.clone(),
            table: table.name.clone(),
            columnnames: row.keys().cloned().collect(),
            columntypes: Vec::new(),
            columnvalues: row.values().cloned().collect(),
            oldkeys: None,
        }
    }
}

/// Row-carrying change kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// A decoded change: the full new row for inserts and updates, the old key
/// columns for deletes.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub table: TableRef,
    pub kind: ChangeKind,
    pub row: Row,
}

/// Decode a raw record.
///
/// Returns `Ok(None)` for `truncate` and `message` records, which are
/// logged and dropped.
pub fn decode(raw: &RawChange) -> Result<Option<ChangeEvent>> {
    let table = raw.table_ref();
    let (kind, row) = match raw.kind {
        RawKind::Insert => (
            ChangeKind::Insert,
            zip_columns(&raw.columnnames, &raw.columnvalues)?,
        ),
        RawKind::Update => (
            ChangeKind::Update,
            zip_columns(&raw.columnnames, &raw.columnvalues)?,
        ),
        RawKind::Delete => {
            let oldkeys = raw.oldkeys.as_ref().ok_or_else(|| {
                Error::MalformedChange(format!("delete on {table} carries no old keys"))
            })?;
            (
                ChangeKind::Delete,
                zip_columns(&oldkeys.keynames, &oldkeys.keyvalues)?,
            )
        }
        RawKind::Truncate | RawKind::Message => {
            error!(
                "received change kind `{:?}` on {}; only insert, update and delete are supported",
                raw.kind, table
            );
            return Ok(None);
        }
    };

    debug!("decoded {:?} on {}: {} columns", kind, table, row.len());
    Ok(Some(ChangeEvent { table, kind, row }))
}

fn zip_columns(names: &[String], values: &[Value]) -> Result<Row> {
    if names.len() != values.len() {
        return Err(Error::MalformedChange(format!(
            "{} column names but {} values",
            names.len(),
            values.len()
        )));
    }
    Ok(names.iter().cloned().zip(values.iter().cloned()).collect())
}
