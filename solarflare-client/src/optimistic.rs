//! Local, unconfirmed edits
//!
//! An optimistic change is applied to the replica immediately and stays
//! visible until the server confirms the row or the caller rolls it back
//! with [`crate::ReplicaCache::clear_override`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

use solarflare_common::types::Row;

/// An optimistic edit of one row, addressed by primary key value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum OptimisticChange {
    /// Add a row the server has not seen yet
    Insert { pk: Value, data: Row },
    /// Patch a confirmed row; `data` is shallow-merged over its value
    Update { pk: Value, data: Row },
    /// Hide a row until the server confirms its deletion
    Delete { pk: Value },
}

impl OptimisticChange {
    pub fn insert(pk: impl Into<Value>, data: Row) -> Self {
        Self::Insert { pk: pk.into(), data }
    }

    pub fn update(pk: impl Into<Value>, data: Row) -> Self {
        Self::Update { pk: pk.into(), data }
    }

    pub fn delete(pk: impl Into<Value>) -> Self {
        Self::Delete { pk: pk.into() }
    }

    pub fn pk(&self) -> &Value {
        match self {
            Self::Insert { pk, .. } | Self::Update { pk, .. } | Self::Delete { pk } => pk,
        }
    }
}
