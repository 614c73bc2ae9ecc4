//! Bootstrap snapshot reads

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use solarflare_common::error::Result;
use solarflare_common::types::{Row, ScopeKey, TableInfo, TableRef};

use crate::filter::scope_for_row;

/// Reads the current rows of a table visible to one scope
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// All rows of `info.table`; for RLS tables only those whose RLS column
    /// matches `scope`.
    async fn select_all(&self, info: &TableInfo, scope: Option<&ScopeKey>) -> Result<Vec<Row>>;
}

/// In-memory table contents, for embedding and tests
#[derive(Default)]
pub struct MemorySnapshotSource {
    tables: RwLock<HashMap<TableRef, Vec<Row>>>,
}

impl MemorySnapshotSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the contents of a table
    pub fn set_rows(&self, table: TableRef, rows: Vec<Row>) {
        self.tables.write().insert(table, rows);
    }

    /// Append one row
    pub fn push_row(&self, table: TableRef, row: Row) {
        self.tables.write().entry(table).or_default().push(row);
    }
}

#[async_trait]
impl SnapshotSource for MemorySnapshotSource {
    async fn select_all(&self, info: &TableInfo, scope: Option<&ScopeKey>) -> Result<Vec<Row>> {
        let tables = self.tables.read();
        let Some(rows) = tables.get(&info.table) else {
            return Ok(Vec::new());
        };

        if !info.rls_enabled() {
            return Ok(rows.clone());
        }

        let mut visible = Vec::new();
        for row in rows {
            if scope_for_row(info, row)?.as_ref() == scope && scope.is_some() {
                visible.push(row.clone());
            }
        }
        Ok(visible)
    }
}
