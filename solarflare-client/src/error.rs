//! Error types for the client replica

use thiserror::Error;

use solarflare_common::types::TableRef;

use crate::slot::PrimaryKey;

/// Errors raised by the replica and its connection
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Table {0} is not subscribed")]
    UntrackedTable(TableRef),

    #[error("Table {0} is still loading")]
    TableLoading(TableRef),

    #[error("Row {pk} already exists in {table}")]
    RowExists { table: TableRef, pk: PrimaryKey },

    #[error("Row {pk} does not exist in {table}")]
    RowMissing { table: TableRef, pk: PrimaryKey },

    #[error("Row {pk} in {table} is pending deletion")]
    RowDeleted { table: TableRef, pk: PrimaryKey },

    #[error("Row {pk} in {table} has not been confirmed by the server")]
    RowNotConfirmed { table: TableRef, pk: PrimaryKey },

    #[error("Row {pk} in {table} has no local change to undo")]
    NothingToUndo { table: TableRef, pk: PrimaryKey },

    #[error("Row in {table} has no value for primary key column {column}")]
    MissingPrimaryKey { table: TableRef, column: String },

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Not connected")]
    NotConnected,
}

pub type Result<T> = std::result::Result<T, ClientError>;

impl ClientError {
    /// Whether the error rejects an optimistic mutation (as opposed to a
    /// transport or protocol failure)
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::UntrackedTable(_)
                | Self::TableLoading(_)
                | Self::RowExists { .. }
                | Self::RowMissing { .. }
                | Self::RowDeleted { .. }
                | Self::RowNotConfirmed { .. }
                | Self::NothingToUndo { .. }
        )
    }
}
