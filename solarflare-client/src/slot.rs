//! Row slots
//!
//! Each replicated row lives in a slot that pairs the last server-confirmed
//! value with an optional local override. Server confirmations always win:
//! applying a confirmed change resets the slot to [`Slot::Normal`].

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use solarflare_common::types::Row;

/// Primary key value of a row, compared by its canonical JSON text so that
/// `1` and `"1"` stay distinct.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PrimaryKey(String);

impl PrimaryKey {
    /// Key for a JSON value; null has no key.
    pub fn from_value(value: &Value) -> Option<Self> {
        if value.is_null() {
            None
        } else {
            Some(Self(value.to_string()))
        }
    }

    /// Read the key column of `row`
    pub fn of_row(row: &Row, column: &str) -> Option<Self> {
        row.get(column).and_then(Self::from_value)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<i64> for PrimaryKey {
    fn from(value: i64) -> Self {
        Self(value.to_string())
    }
}

impl From<&str> for PrimaryKey {
    fn from(value: &str) -> Self {
        Self(Value::from(value).to_string())
    }
}

impl fmt::Display for PrimaryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One row of a replicated table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Slot<T = Row> {
    /// Confirmed by the server, no local change
    Normal { value: T },
    /// Confirmed value with a local patch applied on top
    Updated {
        value: T,
        #[serde(rename = "override")]
        pending: T,
    },
    /// Confirmed value hidden by a local delete
    Deleted { value: T },
    /// Local insert the server has not confirmed
    Inserted {
        #[serde(rename = "override")]
        pending: T,
    },
}

impl<T> Slot<T> {
    /// What the application sees; `None` while a delete is pending
    pub fn visible(&self) -> Option<&T> {
        match self {
            Self::Normal { value } => Some(value),
            Self::Updated { pending, .. } | Self::Inserted { pending } => Some(pending),
            Self::Deleted { .. } => None,
        }
    }

    /// Last server-confirmed value, if any
    pub fn confirmed(&self) -> Option<&T> {
        match self {
            Self::Normal { value } | Self::Updated { value, .. } | Self::Deleted { value } => {
                Some(value)
            }
            Self::Inserted { .. } => None,
        }
    }

    /// Whether a local change is outstanding
    pub fn has_override(&self) -> bool {
        !matches!(self, Self::Normal { .. })
    }
}

/// Shallow merge: keys of `patch` replace those of `base`
pub fn merge(base: &Row, patch: &Row) -> Row {
    let mut merged = base.clone();
    for (key, value) in patch {
        merged.insert(key.clone(), value.clone());
    }
    merged
}
