//! Error types for the Solarflare relay

use thiserror::Error;

use crate::types::TableRef;

/// Relay error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration Errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("Table {0} has no primary key, which is not supported")]
    MissingPrimaryKey(TableRef),

    #[error("Table {table} has a composite primary key ({}), which is not supported", columns.join(", "))]
    CompositePrimaryKey { table: TableRef, columns: Vec<String> },

    // Protocol Errors
    #[error("Invalid token")]
    InvalidToken,

    #[error("Token expired")]
    TokenExpired,

    #[error("Token claims do not contain `{0}`")]
    MissingClaim(String),

    #[error("Table not published: {0}")]
    UnknownTable(TableRef),

    #[error("Invalid subscribe message: {0}")]
    InvalidSubscribe(String),

    // Data Errors
    #[error("Change on {table} does not specify the required RLS column `{column}`")]
    MissingRlsColumn { table: TableRef, column: String },

    #[error("Malformed change: {0}")]
    MalformedChange(String),

    // Infrastructure Errors
    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// Result type alias for relay operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether the relay must exit when this error reaches startup code.
    ///
    /// Protocol and data errors only ever drop the offending request or event.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::ConfigError(_)
            | Self::InvalidManifest(_)
            | Self::MissingPrimaryKey(_)
            | Self::CompositePrimaryKey { .. }
            | Self::DatabaseError(_)
            | Self::TransportError(_)
            | Self::IoError(_) => true,

            Self::InvalidToken
            | Self::TokenExpired
            | Self::MissingClaim(_)
            | Self::UnknownTable(_)
            | Self::InvalidSubscribe(_)
            | Self::MissingRlsColumn { .. }
            | Self::MalformedChange(_)
            | Self::JsonError(_) => false,
        }
    }

    /// Stable error code used in log lines
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::ConfigError(_) => "config_error",
            Self::InvalidManifest(_) => "invalid_manifest",
            Self::MissingPrimaryKey(_) => "missing_primary_key",
            Self::CompositePrimaryKey { .. } => "composite_primary_key",
            Self::InvalidToken => "invalid_token",
            Self::TokenExpired => "token_expired",
            Self::MissingClaim(_) => "missing_claim",
            Self::UnknownTable(_) => "unknown_table",
            Self::InvalidSubscribe(_) => "invalid_subscribe",
            Self::MissingRlsColumn { .. } => "missing_rls_column",
            Self::MalformedChange(_) => "malformed_change",
            Self::DatabaseError(_) => "database_error",
            Self::TransportError(_) => "transport_error",
            Self::IoError(_) => "io_error",
            Self::JsonError(_) => "json_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(Error::MissingPrimaryKey(TableRef::public("todos")).is_fatal());
        assert!(Error::ConfigError("no auth".to_string()).is_fatal());
        assert!(!Error::InvalidToken.is_fatal());
        assert!(!Error::UnknownTable(TableRef::public("secrets")).is_fatal());
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::TokenExpired.error_code(), "token_expired");
        assert_eq!(
            Error::MissingRlsColumn {
                table: TableRef::public("employees"),
                column: "user_id".to_string(),
            }
            .error_code(),
            "missing_rls_column"
        );
    }

    #[test]
    fn test_composite_key_message() {
        let err = Error::CompositePrimaryKey {
            table: TableRef::new("hr", "assignments"),
            columns: vec!["a".to_string(), "b".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "Table hr.assignments has a composite primary key (a, b), which is not supported"
        );
    }
}
