//! Published table registry
//!
//! Built once at startup from the manifest and the database's primary key
//! metadata; read-only afterwards.

use std::collections::HashMap;

use async_trait::async_trait;
use tracing::info;

use solarflare_common::error::{Error, Result};
use solarflare_common::manifest::Manifest;
use solarflare_common::types::{channel_name, TableInfo, TableRef};

/// Source of primary key metadata
#[async_trait]
pub trait Introspect: Send + Sync {
    /// Primary key column names of `table`, in key order. Empty when the
    /// table has no primary key.
    async fn primary_key_columns(&self, table: &TableRef) -> Result<Vec<String>>;
}

/// The set of tables the relay publishes
#[derive(Debug, Clone, Default)]
pub struct TableRegistry {
    tables: HashMap<TableRef, TableInfo>,
    claim: Option<String>,
}

impl TableRegistry {
    /// Resolve every manifest entry to a [`TableInfo`].
    ///
    /// Fails when a table has no primary key or a composite one.
    pub async fn build(manifest: &Manifest, introspect: &dyn Introspect) -> Result<Self> {
        let mut tables = Vec::with_capacity(manifest.tables.len());

        for entry in &manifest.tables {
            let mut columns = introspect.primary_key_columns(&entry.table).await?;
            let pk = match columns.len() {
                0 => return Err(Error::MissingPrimaryKey(entry.table.clone())),
                1 => columns.remove(0),
                _ => {
                    return Err(Error::CompositePrimaryKey {
                        table: entry.table.clone(),
                        columns,
                    })
                }
            };
            info!(table = %entry.table, pk = %pk, rls = ?entry.rls, "Publishing table");
            tables.push(TableInfo::new(entry.table.clone(), pk, entry.rls.clone()));
        }

        Self::from_tables(tables, manifest.claim().map(str::to_string))
    }

    /// Build a registry from resolved tables
    pub fn from_tables(tables: Vec<TableInfo>, claim: Option<String>) -> Result<Self> {
        if claim.is_none() {
            if let Some(info) = tables.iter().find(|t| t.rls_enabled()) {
                return Err(Error::ConfigError(format!(
                    "table {} uses RLS but no JWT claim is configured",
                    info.table
                )));
            }
        }

        check_channel_names(&tables)?;

        Ok(Self {
            tables: tables.into_iter().map(|t| (t.table.clone(), t)).collect(),
            claim,
        })
    }

    pub fn get(&self, table: &TableRef) -> Option<&TableInfo> {
        self.tables.get(table)
    }

    /// Name of the JWT claim that scopes RLS tables
    pub fn claim(&self) -> Option<&str> {
        self.claim.as_deref()
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TableInfo> {
        self.tables.values()
    }
}

/// Scoped channels are `<table>.<scope>`, so an RLS table named `app` would
/// share channels with a table `app.todos` (or a scoped `app.x`).
fn check_channel_names(tables: &[TableInfo]) -> Result<()> {
    for scoped in tables.iter().filter(|t| t.rls_enabled()) {
        let prefix = format!("{}.", channel_name(&scoped.table, None));
        if let Some(other) = tables
            .iter()
            .find(|t| channel_name(&t.table, None).starts_with(&prefix))
        {
            return Err(Error::ConfigError(format!(
                "channels of {} and {} can collide",
                scoped.table, other.table
            )));
        }
    }
    Ok(())
}
