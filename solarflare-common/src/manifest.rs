//! The `solarflare.json` manifest
//!
//! Lists the published tables, their RLS column and the JWT claim that
//! scopes RLS-enabled tables. Produced by the setup tooling; the relay
//! only reads and validates it.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::{rls_column, TableRef};

/// A published table as declared in the manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    #[serde(rename = "ref")]
    pub table: TableRef,
    #[serde(with = "rls_column")]
    pub rls: Option<String>,
}

/// How subscribers authenticate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AuthSection {
    Jwt { claim: String },
}

/// Parsed manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub tables: Vec<ManifestEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthSection>,
}

impl Manifest {
    /// Parse and validate manifest JSON
    pub fn from_json(raw: &str) -> Result<Self> {
        let manifest: Self =
            serde_json::from_str(raw).map_err(|e| Error::InvalidManifest(e.to_string()))?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Read, parse and validate the manifest file at `path`
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::InvalidManifest(format!(
                "no manifest file found at {}",
                path.display()
            )));
        }
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    /// Check the cross-entry invariants.
    ///
    /// Any RLS-enabled table requires an auth claim.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for entry in &self.tables {
            if !seen.insert(&entry.table) {
                return Err(Error::InvalidManifest(format!(
                    "table {} is listed more than once",
                    entry.table
                )));
            }
            if matches!(entry.rls.as_deref(), Some("")) {
                return Err(Error::InvalidManifest(format!(
                    "table {} has an empty RLS column name",
                    entry.table
                )));
            }
        }

        if let Some(AuthSection::Jwt { claim }) = &self.auth {
            if claim.is_empty() {
                return Err(Error::InvalidManifest("auth claim is empty".to_string()));
            }
        }

        if self.claim().is_none() {
            if let Some(entry) = self.tables.iter().find(|e| e.rls.is_some()) {
                return Err(Error::ConfigError(format!(
                    "table {} has RLS enabled but the manifest has no `auth` section naming a JWT claim",
                    entry.table
                )));
            }
        }

        Ok(())
    }

    /// The JWT claim carrying the RLS value
    pub fn claim(&self) -> Option<&str> {
        match &self.auth {
            Some(AuthSection::Jwt { claim }) => Some(claim),
            None => None,
        }
    }

    pub fn entry(&self, table: &TableRef) -> Option<&ManifestEntry> {
        self.tables.iter().find(|e| &e.table == table)
    }
}
