//! Common types shared by the relay and the replica

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Schema used when a table reference does not name one
pub const DEFAULT_SCHEMA: &str = "public";

/// A decoded row: column name to dynamic value
pub type Row = serde_json::Map<String, Value>;

// ============================================================================
// Table Identity
// ============================================================================

/// Canonical `(schema, name)` identity of a table
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableRef {
    #[serde(default = "default_schema")]
    pub schema: String,
    pub name: String,
}

fn default_schema() -> String {
    DEFAULT_SCHEMA.to_string()
}

impl TableRef {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }

    /// A table in the default schema
    pub fn public(name: impl Into<String>) -> Self {
        Self::new(DEFAULT_SCHEMA, name)
    }

    /// Parse `name` or `schema.name`
    pub fn parse(qualified: &str) -> Self {
        match qualified.split_once('.') {
            Some((schema, name)) => Self::new(schema, name),
            None => Self::public(qualified),
        }
    }

    /// Whether this table lives in the default schema
    pub fn is_default_schema(&self) -> bool {
        self.schema == DEFAULT_SCHEMA
    }

    /// Always-qualified `schema.name`
    pub fn qualified(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }

    /// Quoted identifier for use in SQL text
    pub fn sql_identifier(&self) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(&self.name))
    }
}

/// Renders `name` for the default schema and `schema.name` otherwise.
impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_default_schema() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}.{}", self.schema, self.name)
        }
    }
}

/// Quote a Postgres identifier
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

// ============================================================================
// Scoping
// ============================================================================

/// Broadcast-channel suffix derived from an RLS value
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScopeKey(String);

impl ScopeKey {
    /// Scalar JSON values scope a channel; null, empty strings and
    /// compound values cannot.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) if !s.is_empty() => Some(Self(s.clone())),
            Value::Number(n) => Some(Self(n.to_string())),
            Value::Bool(b) => Some(Self(b.to_string())),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Channel a change or subscription for `table` is routed through
pub fn channel_name(table: &TableRef, scope: Option<&ScopeKey>) -> String {
    match scope {
        Some(scope) => format!("{table}.{scope}"),
        None => table.to_string(),
    }
}

// ============================================================================
// Table Metadata
// ============================================================================

/// A published table resolved against the database
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableInfo {
    #[serde(rename = "ref")]
    pub table: TableRef,
    /// Single-column primary key
    pub pk: String,
    /// RLS column, serialized as `false` when disabled
    #[serde(with = "rls_column")]
    pub rls: Option<String>,
}

impl TableInfo {
    pub fn new(table: TableRef, pk: impl Into<String>, rls: Option<String>) -> Self {
        Self {
            table,
            pk: pk.into(),
            rls,
        }
    }

    pub fn rls_enabled(&self) -> bool {
        self.rls.is_some()
    }
}

/// `string | false` encoding of an optional RLS column
pub(crate) mod rls_column {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Flag(bool),
        Column(String),
    }

    pub fn serialize<S: Serializer>(value: &Option<String>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(column) => s.serialize_str(column),
            None => s.serialize_bool(false),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
        match Repr::deserialize(d)? {
            Repr::Flag(false) => Ok(None),
            Repr::Flag(true) => Err(D::Error::custom(
                "`rls` must be a column name or `false`",
            )),
            Repr::Column(column) => Ok(Some(column)),
        }
    }
}
